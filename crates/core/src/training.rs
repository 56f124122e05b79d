//! Contrastive training forward pass.
//!
//! A batch holds `B` queries and `B * (1 + k)` documents laid out as
//! `[positive, negative_1, .., negative_k]` per query. Each query is scored
//! against its own `1 + k` documents, and optionally against every document
//! in the batch for an in-batch negative cross-entropy loss. Embeddings may
//! first be gathered from all data-parallel ranks; only the local slot keeps
//! its autograd history.

use candle_core::{DType, Tensor};
use tracing::debug;

use crate::config::ModalitySet;
use crate::distributed::DeviceCommunicator;
use crate::error::{FlmrError, Result};
use crate::models::{DocOutputMode, EncoderInputs, FlmrModel};
use crate::scoring::{colbert_score, score_reduce};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContrastiveConfig {
    pub use_in_batch_negatives: bool,
    pub in_batch_negatives_from_all_ranks: bool,
    /// Negatives per query (`k`).
    pub num_negative_examples: usize,
    pub query_modality: Option<ModalitySet>,
    pub context_modality: Option<ModalitySet>,
}

impl Default for ContrastiveConfig {
    fn default() -> Self {
        Self {
            use_in_batch_negatives: true,
            in_batch_negatives_from_all_ranks: false,
            num_negative_examples: 1,
            query_modality: None,
            context_modality: None,
        }
    }
}

impl ContrastiveConfig {
    /// Documents per query.
    pub fn num_ways(&self) -> usize {
        self.num_negative_examples + 1
    }
}

#[derive(Debug)]
pub struct ContrastiveOutput {
    /// `(B * (1 + k),)` score of each query against its own documents.
    pub scores: Tensor,
    /// `(B, B * (1 + k))` cross scores, when in-batch negatives are on.
    pub in_batch_scores: Option<Tensor>,
    /// Scalar in-batch negative loss.
    pub loss: Option<Tensor>,
}

impl ContrastiveOutput {
    /// Scores reshaped to `(B, 1 + k)`, positive first.
    pub fn scores_per_query(&self, num_ways: usize) -> Result<Tensor> {
        let n = self.scores.dim(0)?;
        if num_ways == 0 || n % num_ways != 0 {
            return Err(FlmrError::shape_mismatch(format!(
                "{n} scores cannot be split into groups of {num_ways}"
            )));
        }
        Ok(self.scores.reshape((n / num_ways, num_ways))?)
    }
}

pub struct ContrastiveTrainer<'a> {
    model: &'a FlmrModel,
    comm: &'a dyn DeviceCommunicator,
    config: ContrastiveConfig,
}

impl<'a> ContrastiveTrainer<'a> {
    pub fn new(
        model: &'a FlmrModel,
        comm: &'a dyn DeviceCommunicator,
        config: ContrastiveConfig,
    ) -> Self {
        Self {
            model,
            comm,
            config,
        }
    }

    pub fn config(&self) -> &ContrastiveConfig {
        &self.config
    }

    /// Encode both sides and score them.
    ///
    /// With `in_batch_negatives_from_all_ranks` every rank must call this
    /// in lock step; a missing rank blocks the others.
    pub fn forward(
        &self,
        queries: &EncoderInputs<'_>,
        documents: &EncoderInputs<'_>,
    ) -> Result<ContrastiveOutput> {
        let q = self
            .model
            .query_with(queries, self.config.query_modality)?
            .embeddings;
        let (d, d_mask) = self
            .model
            .doc_with(documents, DocOutputMode::WithMask, self.config.context_modality)?
            .into_padded()?;

        let (q, d, d_mask) = if self.config.in_batch_negatives_from_all_ranks {
            gather_from_all_ranks(self.comm, &q, &d, &d_mask)?
        } else {
            (q, d, d_mask)
        };
        self.score_encoded(&q, &d, &d_mask)
    }

    /// Score already encoded (and, if wanted, gathered) embeddings.
    pub fn score_encoded(&self, q: &Tensor, d: &Tensor, d_mask: &Tensor) -> Result<ContrastiveOutput> {
        let num_ways = self.config.num_ways();
        let batch = q.dim(0)?;
        let n_docs = d.dim(0)?;
        if n_docs != batch * num_ways {
            return Err(FlmrError::shape_mismatch(format!(
                "{batch} queries with {num_ways} documents each need {} documents, got {n_docs}",
                batch * num_ways
            )));
        }

        let q_dup = repeat_interleave(q, num_ways)?;
        let scores = colbert_score(&q_dup, d, d_mask)?;
        debug!(batch, num_ways, "scored aligned query/document pairs");

        let (in_batch_scores, loss) = if self.config.use_in_batch_negatives {
            let (s, l) = compute_in_batch_loss(q, d, d_mask)?;
            (Some(s), Some(l))
        } else {
            (None, None)
        };
        Ok(ContrastiveOutput {
            scores,
            in_batch_scores,
            loss,
        })
    }
}

/// `(B, ..)` to `(B * times, ..)` with each row repeated in place.
pub fn repeat_interleave(t: &Tensor, times: usize) -> Result<Tensor> {
    let mut dims = t.dims().to_vec();
    let batch = dims[0];
    let mut expanded = dims.clone();
    expanded.insert(1, times);
    dims[0] = batch * times;
    Ok(t.unsqueeze(1)?
        .broadcast_as(expanded)?
        .contiguous()?
        .reshape(dims)?)
}

/// Column of each query's own positive in the flattened document axis.
pub fn in_batch_labels(batch: usize, num_negative_examples: usize) -> Vec<u32> {
    let step = num_negative_examples + 1;
    (0..batch).map(|i| (i * step) as u32).collect()
}

/// Score every query against every document and apply cross-entropy with
/// [`in_batch_labels`]. Computed in `F32`. Returns `(scores (B, M), loss)`.
pub fn compute_in_batch_loss(q: &Tensor, d: &Tensor, d_mask: &Tensor) -> Result<(Tensor, Tensor)> {
    let (batch, q_len, dim) = q.dims3()?;
    let (n_docs, d_len, d_dim) = d.dims3()?;
    if d_dim != dim {
        return Err(FlmrError::shape_mismatch(format!(
            "query dim {dim} != document dim {d_dim}"
        )));
    }
    if batch == 0 || n_docs % batch != 0 {
        return Err(FlmrError::shape_mismatch(format!(
            "{n_docs} documents are not a multiple of {batch} queries"
        )));
    }
    let num_ways = n_docs / batch;

    // (B * M, d, dim) @ (B * M, dim, q): every query against every document.
    let docs = d
        .to_dtype(DType::F32)?
        .unsqueeze(0)?
        .broadcast_as((batch, n_docs, d_len, dim))?
        .contiguous()?
        .reshape((batch * n_docs, d_len, dim))?;
    let queries = q
        .to_dtype(DType::F32)?
        .transpose(1, 2)?
        .unsqueeze(1)?
        .broadcast_as((batch, n_docs, dim, q_len))?
        .contiguous()?
        .reshape((batch * n_docs, dim, q_len))?;
    let sims = docs.matmul(&queries)?;
    let mask = d_mask
        .unsqueeze(0)?
        .broadcast_as((batch, n_docs, d_len))?
        .reshape((batch * n_docs, d_len))?;

    let scores = score_reduce(&sims, &mask)?.reshape((batch, n_docs))?;
    let labels = Tensor::new(
        in_batch_labels(batch, num_ways - 1).as_slice(),
        scores.device(),
    )?;
    let loss = candle_nn::loss::cross_entropy(&scores, &labels)?;
    Ok((scores, loss))
}

/// Concatenate `q`, `d` and `d_mask` from every rank along the batch axis.
///
/// Remote slots are detached; the local slot is the caller's own tensor so
/// gradients still flow into this rank's encoders. With a single rank the
/// inputs come back unchanged.
pub fn gather_from_all_ranks(
    comm: &dyn DeviceCommunicator,
    q: &Tensor,
    d: &Tensor,
    d_mask: &Tensor,
) -> Result<(Tensor, Tensor, Tensor)> {
    let pg = comm.process_group();
    if pg.is_single() {
        return Ok((q.clone(), d.clone(), d_mask.clone()));
    }
    let rank = pg.rank();
    let gather = |t: &Tensor| -> Result<Tensor> {
        let mut parts = comm.all_gather_into_list(&t.detach())?;
        if rank >= parts.len() {
            return Err(FlmrError::shape_mismatch(format!(
                "rank {rank} missing from {} gathered parts",
                parts.len()
            )));
        }
        parts[rank] = t.clone();
        Ok(Tensor::cat(&parts, 0)?)
    };
    let q = gather(q)?;
    let d = gather(d)?;
    let d_mask = gather(d_mask)?;
    debug!(
        rank,
        world_size = pg.world_size(),
        queries = q.dim(0)?,
        documents = d.dim(0)?,
        "gathered embeddings from all ranks"
    );
    Ok((q, d, d_mask))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{InProcessCommunicator, LocalProcessGroup, MockCommunicator};
    use crate::testing::{random_model, tiny_flmr_config};
    use candle_core::{Device, Var};

    #[test]
    fn test_in_batch_labels() {
        assert_eq!(in_batch_labels(2, 1), vec![0, 2]);
        assert_eq!(in_batch_labels(2, 2), vec![0, 3]);
        assert_eq!(in_batch_labels(3, 0), vec![0, 1, 2]);
    }

    #[test]
    fn test_repeat_interleave() {
        let t = Tensor::new(&[[1f32, 2.], [3., 4.]], &Device::Cpu).unwrap();
        let r = repeat_interleave(&t, 2).unwrap();
        assert_eq!(
            r.to_vec2::<f32>().unwrap(),
            vec![vec![1., 2.], vec![1., 2.], vec![3., 4.], vec![3., 4.]]
        );
    }

    #[test]
    fn test_in_batch_scores_match_pairwise_scoring() {
        let dev = Device::Cpu;
        let q = Tensor::randn(0f32, 1., (2, 3, 4), &dev).unwrap();
        let d = Tensor::randn(0f32, 1., (4, 5, 4), &dev).unwrap();
        let mask = Tensor::new(
            &[[1u8, 1, 1, 0, 0], [1, 1, 1, 1, 1], [1, 0, 0, 0, 0], [1, 1, 0, 0, 0]],
            &dev,
        )
        .unwrap();
        let (scores, loss) = compute_in_batch_loss(&q, &d, &mask).unwrap();
        assert_eq!(scores.dims(), &[2, 4]);
        assert_eq!(loss.dims(), &[] as &[usize]);

        for i in 0..2 {
            let qi = q.narrow(0, i, 1).unwrap();
            let expected = colbert_score(&qi, &d, &mask).unwrap().to_vec1::<f32>().unwrap();
            let got = scores.get(i).unwrap().to_vec1::<f32>().unwrap();
            for (a, b) in expected.iter().zip(&got) {
                assert!((a - b).abs() < 1e-4, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_in_batch_loss_prefers_matching_positive() {
        let dev = Device::Cpu;
        // Query i matches document 2i exactly and nothing else.
        let q = Tensor::new(&[[[1f32, 0.]], [[0., 1.]]], &dev).unwrap();
        let d = Tensor::new(&[[[10f32, 0.]], [[0., 0.]], [[0., 10.]], [[0., 0.]]], &dev).unwrap();
        let mask = Tensor::ones((4, 1), DType::U8, &dev).unwrap();
        let (_, loss) = compute_in_batch_loss(&q, &d, &mask).unwrap();
        assert!(loss.to_scalar::<f32>().unwrap() < 1e-3);
    }

    #[test]
    fn test_single_rank_gather_returns_inputs() {
        let comm = MockCommunicator::single();
        let q = Tensor::randn(0f32, 1., (2, 3, 4), &Device::Cpu).unwrap();
        let d = Tensor::randn(0f32, 1., (4, 5, 4), &Device::Cpu).unwrap();
        let m = Tensor::ones((4, 5), DType::U8, &Device::Cpu).unwrap();
        let (q2, d2, m2) = gather_from_all_ranks(&comm, &q, &d, &m).unwrap();
        assert_eq!(q2.id(), q.id());
        assert_eq!(d2.id(), d.id());
        assert_eq!(m2.id(), m.id());
    }

    #[test]
    fn test_simulated_gather_keeps_local_slot() {
        let comm = MockCommunicator::new(LocalProcessGroup::with_rank(1, 3));
        let q = Tensor::ones((2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let d = Tensor::ones((4, 5, 4), DType::F32, &Device::Cpu).unwrap();
        let m = Tensor::ones((4, 5), DType::U8, &Device::Cpu).unwrap();
        let (q2, d2, m2) = gather_from_all_ranks(&comm, &q, &d, &m).unwrap();
        assert_eq!(q2.dims(), &[6, 3, 4]);
        assert_eq!(d2.dims(), &[12, 5, 4]);
        assert_eq!(m2.dims(), &[12, 5]);
    }

    #[test]
    fn test_gathered_gradients_reach_local_slot_only() {
        let handles: Vec<_> = InProcessCommunicator::group(2)
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    let rank = comm.process_group().rank();
                    let dev = Device::Cpu;
                    let q = Var::from_tensor(
                        &Tensor::full(rank as f32 + 1., (1, 2, 2), &dev).unwrap(),
                    )
                    .unwrap();
                    let d = Var::from_tensor(&Tensor::ones((2, 3, 2), DType::F32, &dev).unwrap())
                        .unwrap();
                    let m = Tensor::ones((2, 3), DType::U8, &dev).unwrap();
                    let (gq, gd, gm) =
                        gather_from_all_ranks(&comm, q.as_tensor(), d.as_tensor(), &m).unwrap();
                    assert_eq!(gq.dims(), &[2, 2, 2]);
                    assert_eq!(gd.dims(), &[4, 3, 2]);
                    assert_eq!(gm.dims(), &[4, 3]);
                    let firsts = gq.narrow(2, 0, 1).unwrap().flatten_all().unwrap();
                    assert_eq!(firsts.to_vec1::<f32>().unwrap(), vec![1., 1., 2., 2.]);

                    let grads = gq.sum_all().unwrap().backward().unwrap();
                    let gq_grad = grads.get(q.as_tensor()).unwrap();
                    gq_grad.to_vec3::<f32>().unwrap()
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), vec![vec![vec![1f32, 1.], vec![1., 1.]]]);
        }
    }

    #[test]
    fn test_forward_with_tiny_model() {
        let (model, tok, varmap) = random_model(tiny_flmr_config());
        let comm = MockCommunicator::single();
        let trainer = ContrastiveTrainer::new(
            &model,
            &comm,
            ContrastiveConfig {
                query_modality: Some(ModalitySet::TextOnly),
                in_batch_negatives_from_all_ranks: true,
                ..Default::default()
            },
        );
        let q = tok
            .tensorize(&tok.encode_batch(&["t1 t2", "t3"]).unwrap(), &Device::Cpu)
            .unwrap();
        let d = tok
            .tensorize(
                &tok.encode_batch(&["t1 t2 t9", "t4", "t3 t5", "t6 t7 t8"]).unwrap(),
                &Device::Cpu,
            )
            .unwrap();
        let out = trainer
            .forward(
                &EncoderInputs::text(&q.input_ids, &q.attention_mask),
                &EncoderInputs::text(&d.input_ids, &d.attention_mask),
            )
            .unwrap();
        assert_eq!(out.scores.dims(), &[4]);
        assert_eq!(out.scores_per_query(2).unwrap().dims(), &[2, 2]);
        assert_eq!(out.in_batch_scores.as_ref().unwrap().dims(), &[2, 4]);

        let loss = out.loss.unwrap();
        let grads = loss.backward().unwrap();
        let with_grad = varmap
            .all_vars()
            .iter()
            .filter(|v| grads.get(v.as_tensor()).is_some())
            .count();
        assert!(with_grad > 0);
    }

    #[test]
    fn test_forward_rejects_misaligned_documents() {
        let (model, tok, _varmap) = random_model(tiny_flmr_config());
        let comm = MockCommunicator::single();
        let trainer = ContrastiveTrainer::new(
            &model,
            &comm,
            ContrastiveConfig {
                query_modality: Some(ModalitySet::TextOnly),
                num_negative_examples: 2,
                ..Default::default()
            },
        );
        let q = tok
            .tensorize(&tok.encode_batch(&["t1", "t2"]).unwrap(), &Device::Cpu)
            .unwrap();
        let d = tok
            .tensorize(&tok.encode_batch(&["t1", "t2", "t3", "t4"]).unwrap(), &Device::Cpu)
            .unwrap();
        let err = trainer
            .forward(
                &EncoderInputs::text(&q.input_ids, &q.attention_mask),
                &EncoderInputs::text(&d.input_ids, &d.attention_mask),
            )
            .unwrap_err();
        assert!(matches!(err, FlmrError::ShapeMismatch(_)));
    }
}
