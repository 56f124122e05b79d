//! Late-interaction (MaxSim) scoring.
//!
//! For each query token take the maximum similarity over the valid document
//! tokens, then sum over query tokens. Two document layouts are supported:
//! padded `(N, d_len, dim)` with a `(N, d_len)` mask, and packed
//! `(total_tokens, dim)` with per-document lengths. Both reduce through
//! [`sum_query_tokens`], so they agree exactly on the same valid rows.

use candle_core::{DType, Tensor, D};

use crate::error::{FlmrError, Result};

/// Similarity assigned to masked document positions before the max.
pub const MASKED_SCORE: f64 = -9999.0;

/// Reduce raw similarities `(N, d_len, q_len)` with a `(N, d_len)` mask to
/// one score per document, `(N,)`.
pub fn score_reduce(scores: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let (n, d_len, q_len) = scores.dims3()?;
    if mask.dims() != [n, d_len] {
        return Err(FlmrError::shape_mismatch(format!(
            "mask {:?} does not match scores ({n}, {d_len}, {q_len})",
            mask.dims()
        )));
    }
    let keep = mask
        .to_dtype(DType::U8)?
        .unsqueeze(2)?
        .broadcast_as((n, d_len, q_len))?;
    let sentinel = Tensor::full(MASKED_SCORE, (n, d_len, q_len), scores.device())?
        .to_dtype(scores.dtype())?;
    let masked = keep.where_cond(scores, &sentinel)?;
    // (N, q_len)
    let per_query_token = masked.max(1)?;
    sum_query_tokens(&per_query_token)
}

/// `(N, q_len)` per-token maxima to `(N,)` scores.
fn sum_query_tokens(per_query_token: &Tensor) -> Result<Tensor> {
    Ok(per_query_token.sum(D::Minus1)?)
}

/// Score queries against padded documents.
///
/// `q` is `(1 | N, q_len, dim)`, `d` is `(N, d_len, dim)` and `mask` is
/// `(N, d_len)`. A single query is compared with every document; otherwise
/// query `i` is scored only against document `i`. The query is cast to the
/// document dtype first. Returns `(N,)`.
pub fn colbert_score(q: &Tensor, d: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let (q_batch, _q_len, q_dim) = q.dims3()?;
    let (n, _d_len, d_dim) = d.dims3()?;
    if q_batch != 1 && q_batch != n {
        return Err(FlmrError::shape_mismatch(format!(
            "query batch {q_batch} must be 1 or match document batch {n}"
        )));
    }
    if q_dim != d_dim {
        return Err(FlmrError::shape_mismatch(format!(
            "query dim {q_dim} != document dim {d_dim}"
        )));
    }
    let q_t = q.to_dtype(d.dtype())?.transpose(1, 2)?.contiguous()?;
    let scores = if q_batch == 1 && n != 1 {
        d.broadcast_matmul(&q_t)?
    } else {
        d.contiguous()?.matmul(&q_t)?
    };
    score_reduce(&scores, mask)
}

/// Per-segment maximum over packed similarities.
///
/// `scores` is `(total_tokens, q_len)` with documents stored back to back;
/// `lengths[i]` is the number of rows of document `i`. Returns
/// `(N, q_len)` maxima; an empty document yields [`MASKED_SCORE`] for every
/// query token, matching a fully masked padded row.
pub fn segmented_maxsim(scores: &Tensor, lengths: &[usize]) -> Result<Tensor> {
    let (total, q_len) = scores.dims2()?;
    let expected: usize = lengths.iter().sum();
    if expected != total {
        return Err(FlmrError::shape_mismatch(format!(
            "document lengths sum to {expected} but {total} rows were packed"
        )));
    }
    let dtype = scores.dtype();
    let rows = scores.to_dtype(DType::F32)?.to_vec2::<f32>()?;

    let mut maxima = Vec::with_capacity(lengths.len() * q_len);
    let mut offset = 0;
    for &len in lengths {
        let mut best = vec![MASKED_SCORE as f32; q_len];
        for row in &rows[offset..offset + len] {
            for (b, &s) in best.iter_mut().zip(row) {
                if s > *b {
                    *b = s;
                }
            }
        }
        maxima.extend(best);
        offset += len;
    }
    Ok(Tensor::from_vec(maxima, (lengths.len(), q_len), scores.device())?.to_dtype(dtype)?)
}

/// Score one query against packed documents.
///
/// `q` is `(1, q_len, dim)` or `(q_len, dim)`; `d_packed` is
/// `(total_tokens, dim)` and `lengths` gives the rows per document.
/// Returns `(N,)`.
pub fn colbert_score_packed(q: &Tensor, d_packed: &Tensor, lengths: &[usize]) -> Result<Tensor> {
    let q = match q.rank() {
        3 => {
            if q.dim(0)? != 1 {
                return Err(FlmrError::shape_mismatch(
                    "packed scoring works with a single query only",
                ));
            }
            q.squeeze(0)?
        }
        2 => q.clone(),
        r => {
            return Err(FlmrError::shape_mismatch(format!(
                "query must be rank 2 or 3, got rank {r}"
            )))
        }
    };
    let (_q_len, q_dim) = q.dims2()?;
    let (_total, d_dim) = d_packed.dims2()?;
    if q_dim != d_dim {
        return Err(FlmrError::shape_mismatch(format!(
            "query dim {q_dim} != document dim {d_dim}"
        )));
    }
    let q_t = q.to_dtype(d_packed.dtype())?.t()?.contiguous()?;
    let scores = d_packed.contiguous()?.matmul(&q_t)?;
    sum_query_tokens(&segmented_maxsim(&scores, lengths)?)
}

/// MaxSim between one query `(q_len, dim)` and one document `(d_len, dim)`.
pub fn maxsim_score(query_emb: &Tensor, doc_emb: &Tensor) -> Result<f32> {
    let query_emb = query_emb.to_dtype(DType::F32)?;
    let doc_emb = doc_emb.to_dtype(DType::F32)?;
    let sim_matrix = query_emb.matmul(&doc_emb.t()?)?;
    let max_per_query = sim_matrix.max(D::Minus1)?;
    Ok(max_per_query.sum_all()?.to_scalar::<f32>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn t3(data: &[f32], shape: (usize, usize, usize)) -> Tensor {
        Tensor::from_vec(data.to_vec(), shape, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_maxsim_score() {
        let device = Device::Cpu;
        let query =
            Tensor::new(vec![vec![1.0f32, 0.0, 0.0], vec![0.0, 1.0, 0.0]], &device).unwrap();
        let doc = Tensor::new(
            vec![
                vec![0.5f32, 0.5, 0.0],
                vec![1.0, 0.0, 0.0],
                vec![0.0, 0.0, 1.0],
            ],
            &device,
        )
        .unwrap();

        // query[0] best = 1.0 (doc[1]), query[1] best = 0.5 (doc[0])
        let score = maxsim_score(&query, &doc).unwrap();
        assert!((score - 1.5).abs() < 1e-5, "got {score}");
    }

    #[test]
    fn test_mask_excludes_padded_winner() {
        // One doc, two positions; the second would win but is masked.
        let q = t3(&[1.0, 0.0], (1, 1, 2));
        let d = t3(&[0.25, 0.0, 1.0, 0.0], (1, 2, 2));
        let mask = Tensor::new(&[[1u8, 0]], &Device::Cpu).unwrap();
        let scores = colbert_score(&q, &d, &mask).unwrap();
        assert_eq!(scores.to_vec1::<f32>().unwrap(), vec![0.25]);
    }

    #[test]
    fn test_single_query_broadcasts_over_documents() {
        let q = t3(&[1.0, 0.0, 0.0, 1.0], (1, 2, 2));
        let d = t3(
            &[
                1.0, 0.0, 0.0, 1.0, // doc 0: both query tokens match
                0.5, 0.0, 0.0, 0.0, // doc 1
            ],
            (2, 2, 2),
        );
        let mask = Tensor::new(&[[1u8, 1], [1, 1]], &Device::Cpu).unwrap();
        let scores = colbert_score(&q, &d, &mask).unwrap();
        assert_eq!(scores.to_vec1::<f32>().unwrap(), vec![2.0, 0.5]);
    }

    #[test]
    fn test_pairwise_mode_aligns_queries() {
        let q = t3(&[1.0, 0.0, 0.0, 1.0], (2, 1, 2));
        let d = t3(&[1.0, 0.0, 1.0, 0.0], (2, 1, 2));
        let mask = Tensor::new(&[[1u8], [1]], &Device::Cpu).unwrap();
        let scores = colbert_score(&q, &d, &mask).unwrap();
        // query 1 = [0, 1] is only compared with doc 1 = [1, 0]
        assert_eq!(scores.to_vec1::<f32>().unwrap(), vec![1.0, 0.0]);
    }

    #[test]
    fn test_batch_misalignment_is_rejected() {
        let q = Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let d = Tensor::zeros((3, 5, 4), DType::F32, &Device::Cpu).unwrap();
        let mask = Tensor::ones((3, 5), DType::U8, &Device::Cpu).unwrap();
        assert!(matches!(
            colbert_score(&q, &d, &mask),
            Err(FlmrError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_mask_length_mismatch_is_rejected() {
        let q = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let d = Tensor::zeros((2, 5, 4), DType::F32, &Device::Cpu).unwrap();
        let mask = Tensor::ones((2, 4), DType::U8, &Device::Cpu).unwrap();
        assert!(matches!(
            colbert_score(&q, &d, &mask),
            Err(FlmrError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_fully_masked_document_gets_sentinel() {
        let q = Tensor::ones((1, 4, 8), DType::F32, &Device::Cpu).unwrap();
        let d = Tensor::ones((2, 5, 8), DType::F32, &Device::Cpu).unwrap();
        let mask = Tensor::new(&[[1u8, 1, 1, 1, 1], [0, 0, 0, 0, 0]], &Device::Cpu).unwrap();
        let scores = colbert_score(&q, &d, &mask).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(scores[0], 32.0);
        assert_eq!(scores[1], 4.0 * MASKED_SCORE as f32);
    }

    #[test]
    fn test_segmented_maxsim_per_segment() {
        let scores = Tensor::new(
            &[[0.5f32, 2.0], [1.5, -1.0], [3.0, 0.0], [-2.0, 4.0]],
            &Device::Cpu,
        )
        .unwrap();
        let maxima = segmented_maxsim(&scores, &[2, 0, 2]).unwrap();
        let sentinel = MASKED_SCORE as f32;
        assert_eq!(
            maxima.to_vec2::<f32>().unwrap(),
            vec![vec![1.5, 2.0], vec![sentinel, sentinel], vec![3.0, 4.0]]
        );
    }

    #[test]
    fn test_segmented_lengths_must_cover_rows() {
        let scores = Tensor::zeros((4, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            segmented_maxsim(&scores, &[1, 2]),
            Err(FlmrError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_packed_matches_padded() {
        let q = t3(&[1.0, 0.0, 0.5, 0.5, 0.0, 1.0], (1, 3, 2));
        let d = t3(
            &[
                1.0, 0.0, 0.0, 2.0, 9.0, 9.0, // doc 0, last row padded
                0.5, 0.5, 9.0, 9.0, 9.0, 9.0, // doc 1, one valid row
            ],
            (2, 3, 2),
        );
        let mask = Tensor::new(&[[1u8, 1, 0], [1, 0, 0]], &Device::Cpu).unwrap();
        let padded = colbert_score(&q, &d, &mask).unwrap().to_vec1::<f32>().unwrap();

        let packed = Tensor::new(&[[1.0f32, 0.0], [0.0, 2.0], [0.5, 0.5]], &Device::Cpu).unwrap();
        let packed_scores = colbert_score_packed(&q, &packed, &[2, 1])
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(padded, packed_scores);
    }

    #[test]
    fn test_query_is_cast_to_document_dtype() {
        let q = Tensor::ones((1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        let d = Tensor::ones((1, 3, 4), DType::F16, &Device::Cpu).unwrap();
        let mask = Tensor::ones((1, 3), DType::U8, &Device::Cpu).unwrap();
        let scores = colbert_score(&q, &d, &mask).unwrap();
        assert_eq!(scores.dtype(), DType::F16);
        assert_eq!(scores.to_dtype(DType::F32).unwrap().to_vec1::<f32>().unwrap(), vec![8.0]);
    }
}
