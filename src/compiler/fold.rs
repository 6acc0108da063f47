//! Weight transforms applied before serialization: batch-norm folding, the grouped deconvolution
//! transpose, and the fused conv/fc statistics.
use super::CompileError;
use crate::model::{LayerKind, LayerNode};
use crate::tensor::TensorView;

/// Epsilon baked into the fused conv/fc kinds.
const FUSED_EPS: f32 = 1e-5;

/// Per-output-channel affine parameters of a batch norm, already normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormStats {
    pub mean: Vec<f32>,
    /// `sqrt(var + eps)`
    pub std: Vec<f32>,
    pub gamma: Vec<f32>,
    pub beta: Vec<f32>,
}

/// Final weight and bias for one weight-bearing layer.
#[derive(Debug, Clone)]
pub struct FoldedWeights<'a> {
    pub weight: TensorView<'a>,
    pub bias: Option<TensorView<'a>>,
    /// Bias flag the emitted call must carry; a fold always produces a bias.
    pub bias_term: bool,
}

fn invalid(layer: &LayerNode, reason: impl Into<String>) -> CompileError {
    CompileError::InvalidModel {
        layer: layer.name.clone(),
        reason: reason.into(),
    }
}

fn blob<'a>(layer: &'a LayerNode, index: usize) -> Result<&'a [f32], CompileError> {
    layer
        .weights
        .get(index)
        .map(|b| b.data.as_slice())
        .ok_or_else(|| invalid(layer, format!("missing weight tensor {}", index)))
}

fn inverse_scale(factor: &[f32]) -> f32 {
    match factor.first() {
        Some(&f) if f != 0.0 => 1.0 / f,
        _ => 0.0,
    }
}

fn normalize(mean_raw: &[f32], var_raw: &[f32], factor: f32, eps: f32) -> (Vec<f32>, Vec<f32>) {
    let mean = mean_raw.iter().map(|m| m * factor).collect();
    let std = var_raw.iter().map(|v| (v * factor + eps).sqrt()).collect();
    (mean, std)
}

/// Statistics of a `BatchNorm` node, with gamma and beta from the following `Scale` when the
/// batch norm carries exactly three tensors.
pub fn batch_norm_stats(
    bn: &LayerNode,
    scale: Option<&LayerNode>,
) -> Result<BatchNormStats, CompileError> {
    let count = bn.weights.len();
    if count < 3 || count == 4 {
        return Err(invalid(
            bn,
            format!("batch norm needs 3 or at least 5 tensors, found {}", count),
        ));
    }
    let eps = bn.batch_norm.as_ref().map_or(1e-5, |p| p.eps());
    let factor = inverse_scale(blob(bn, 2)?);
    let (mean, std) = normalize(blob(bn, 0)?, blob(bn, 1)?, factor, eps);
    let (gamma, beta) = match scale {
        Some(scale) if count == 3 => (blob(scale, 0)?.to_vec(), blob(scale, 1)?.to_vec()),
        _ if count >= 5 => (blob(bn, 3)?.to_vec(), blob(bn, 4)?.to_vec()),
        _ => (vec![1.0; mean.len()], vec![0.0; mean.len()]),
    };
    Ok(BatchNormStats {
        mean,
        std,
        gamma,
        beta,
    })
}

/// Statistics carried by a fused conv/fc node in tensors 1 through 5.
pub fn fused_stats(layer: &LayerNode) -> Result<BatchNormStats, CompileError> {
    if layer.weights.len() < 6 {
        return Err(invalid(
            layer,
            format!("fused layer needs 6 tensors, found {}", layer.weights.len()),
        ));
    }
    let factor = inverse_scale(blob(layer, 3)?);
    let (mean, std) = normalize(blob(layer, 1)?, blob(layer, 2)?, factor, FUSED_EPS);
    Ok(BatchNormStats {
        mean,
        std,
        gamma: blob(layer, 4)?.to_vec(),
        beta: blob(layer, 5)?.to_vec(),
    })
}

/// `W' = W * gamma / std` per output channel, `B' = (B - mean) * gamma / std + beta`.
pub fn fold_batch_norm(
    weight: &TensorView,
    bias: Option<&TensorView>,
    stats: &BatchNormStats,
) -> Result<(TensorView<'static>, TensorView<'static>), String> {
    let channels = weight.shape.first().copied().unwrap_or(0);
    let check = |name: &str, len: usize| {
        if len == channels {
            Ok(())
        } else {
            Err(format!("{} has {} entries for {} channels", name, len, channels))
        }
    };
    check("mean", stats.mean.len())?;
    check("variance", stats.std.len())?;
    check("gamma", stats.gamma.len())?;
    check("beta", stats.beta.len())?;
    if let Some(b) = bias {
        check("bias", b.len())?;
    }
    let row = weight.row_len();
    let mut w = weight.data.to_vec();
    let mut b = Vec::with_capacity(channels);
    for c in 0..channels {
        let (gamma, std) = (stats.gamma[c], stats.std[c]);
        for v in &mut w[c * row..(c + 1) * row] {
            *v = *v * gamma / std;
        }
        let b0 = bias.map_or(0.0, |t| t.data[c]);
        b.push((b0 - stats.mean[c]) * gamma / std + stats.beta[c]);
    }
    Ok((
        TensorView::from_owned(w, weight.shape.to_vec()),
        TensorView::from_owned(b, vec![channels]),
    ))
}

/// Grouped transpose of a `[O, I, kh, kw]` deconvolution kernel into `[I * G, O / G, kh, kw]`.
/// Each group's `O / G` rows swap their first two axes. Applying it twice restores the input.
pub fn transpose_grouped(weight: &TensorView, group: usize) -> Result<TensorView<'static>, String> {
    if weight.dim() != 4 {
        return Err(format!("expected a 4-D kernel, got {:?}", weight.shape));
    }
    let (o, i, kh, kw) = (weight.size(0), weight.size(1), weight.size(2), weight.size(3));
    if group == 0 || o % group != 0 {
        return Err(format!("{} output rows do not split into {} groups", o, group));
    }
    let rows = o / group;
    let k = kh * kw;
    let mut out = vec![0.0f32; weight.len()];
    for g in 0..group {
        for r in 0..rows {
            for c in 0..i {
                let src = ((g * rows + r) * i + c) * k;
                let dst = ((g * i + c) * rows + r) * k;
                out[dst..dst + k].copy_from_slice(&weight.data[src..src + k]);
            }
        }
    }
    Ok(TensorView::from_owned(out, vec![i * group, rows, kh, kw]))
}

/// Produces the serialized weight and bias of the layer at `anchor`, folding the batch norm at
/// `batch_norm` (and its `scale`) when present.
pub fn transform(
    layers: &[LayerNode],
    anchor: usize,
    batch_norm: Option<usize>,
    scale: Option<usize>,
) -> Result<FoldedWeights<'_>, CompileError> {
    let layer = &layers[anchor];
    let kind = layer.op();
    let first = layer
        .weights
        .first()
        .ok_or_else(|| invalid(layer, "weight-bearing layer has no tensors"))?;
    let weight = TensorView::from_blob(first);
    let bias = layer.weights.get(1).map(TensorView::from_blob);

    if let Some(bn_idx) = batch_norm {
        let bn = &layers[bn_idx];
        let stats = batch_norm_stats(bn, scale.map(|s| &layers[s]))?;
        let group = layer.conv_param().group() as usize;
        let deconv = kind.is_deconv();
        let weight = if deconv {
            transpose_grouped(&weight, group).map_err(|e| invalid(layer, e))?
        } else {
            weight.to_owned()
        };
        let (w, b) = fold_batch_norm(&weight, bias.as_ref(), &stats).map_err(|e| invalid(bn, e))?;
        let w = if deconv {
            transpose_grouped(&w, group).map_err(|e| invalid(layer, e))?
        } else {
            w
        };
        return Ok(FoldedWeights {
            weight: w,
            bias: Some(b),
            bias_term: true,
        });
    }

    if kind.is_fused() {
        let stats = fused_stats(layer)?;
        let zero_bias = TensorView::zeros(vec![weight.shape.first().copied().unwrap_or(0)]);
        let (w, b) = fold_batch_norm(&weight, Some(&zero_bias), &stats).map_err(|e| invalid(layer, e))?;
        return Ok(FoldedWeights {
            weight: w,
            bias: Some(b),
            bias_term: layer.bias_term(),
        });
    }

    // Scale layers only carry a bias tensor when their bias_term is set.
    let bias = if kind == LayerKind::Scale && !layer.bias_term() {
        None
    } else {
        bias
    };
    Ok(FoldedWeights {
        weight,
        bias,
        bias_term: layer.bias_term(),
    })
}
