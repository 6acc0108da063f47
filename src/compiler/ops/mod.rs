use super::emit::{Arg, ListKind, Stmt, Variant};
use super::index::IndexTables;
use super::patterns::FusedPattern;
use super::{CompileError, FunctionRole};
use crate::config::CompileOptions;
use crate::model::{LayerKind, LayerNode, NetworkGraph};

pub mod activations;
pub mod conv;
pub mod detection;
pub mod roi;
pub mod tensor;

/// Everything an emitter may read while lowering one segment.
pub(crate) struct EmitContext<'a> {
    pub graph: &'a NetworkGraph,
    pub tables: &'a IndexTables,
    pub options: &'a CompileOptions,
    pub role: FunctionRole,
    pub seg: &'a FusedPattern,
    /// Bias flag of the anchor after its weights were transformed.
    pub bias_term: bool,
}

impl<'a> EmitContext<'a> {
    pub fn node(&self, pos: usize) -> &'a LayerNode {
        &self.graph.layers[pos]
    }

    pub fn anchor(&self) -> &'a LayerNode {
        self.node(self.seg.anchor)
    }

    /// Node at `offset` inside the segment.
    pub fn at(&self, offset: usize) -> &'a LayerNode {
        self.node(self.seg.anchor + offset)
    }

    pub fn invalid(&self, node: &LayerNode, reason: impl Into<String>) -> CompileError {
        CompileError::InvalidModel {
            layer: node.name.clone(),
            reason: reason.into(),
        }
    }

    fn slot(&self, node: &LayerNode, blob: &str) -> Result<usize, CompileError> {
        self.tables
            .lookup_blob(blob)
            .ok_or_else(|| self.invalid(node, format!("blob `{}` has no slot", blob)))
    }

    fn input_name<'n>(&self, node: &'n LayerNode, i: usize) -> Result<&'n str, CompileError> {
        node.inputs
            .get(i)
            .map(String::as_str)
            .ok_or_else(|| self.invalid(node, format!("missing input {}", i)))
    }

    pub fn bottom_slot(&self, node: &LayerNode, i: usize) -> Result<usize, CompileError> {
        self.slot(node, self.input_name(node, i)?)
    }

    pub fn top_slot(&self, node: &LayerNode, i: usize) -> Result<usize, CompileError> {
        let name = node
            .outputs
            .get(i)
            .ok_or_else(|| self.invalid(node, format!("missing output {}", i)))?;
        self.slot(node, name)
    }

    pub fn bottom(&self, node: &LayerNode, i: usize) -> Result<Arg, CompileError> {
        self.bottom_slot(node, i).map(Arg::Blob)
    }

    pub fn top(&self, node: &LayerNode, i: usize) -> Result<Arg, CompileError> {
        self.top_slot(node, i).map(Arg::Blob)
    }

    pub fn bottoms(&self, node: &LayerNode) -> Result<Vec<Arg>, CompileError> {
        (0..node.inputs.len()).map(|i| self.bottom(node, i)).collect()
    }

    pub fn tops(&self, node: &LayerNode) -> Result<Vec<Arg>, CompileError> {
        (0..node.outputs.len()).map(|i| self.top(node, i)).collect()
    }

    /// Input of a pooling call that reads a backbone feature map. Detection heads fetch these
    /// from the feature map table instead of a local blob.
    pub fn feature(&self, node: &LayerNode, i: usize) -> Result<Arg, CompileError> {
        if self.role.reads_feature_maps() {
            let name = self.input_name(node, i)?;
            return Ok(Arg::symbol(format!("*feat_maps.at(\"{}\")", name)));
        }
        self.bottom(node, i)
    }

    pub fn layer_slot(&self, node: &LayerNode) -> Result<usize, CompileError> {
        self.tables
            .lookup_layer(&node.name)
            .ok_or_else(|| self.invalid(node, "layer has no slot"))
    }

    pub fn weight(&self, node: &LayerNode, j: usize) -> Result<Arg, CompileError> {
        Ok(Arg::Weight(self.layer_slot(node)?, j))
    }

    pub fn push_fc2conv(&self, args: &mut Vec<Arg>) {
        if self.role.uses_fc2conv() {
            args.push(Arg::Flag(Variant::SpeedupFc2Conv));
        }
    }
}

pub(crate) fn dispatch_builtin(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<bool, CompileError> {
    if conv::handle_conv_ops(ctx, out)? {
        return Ok(true);
    }
    if roi::handle_roi_ops(ctx, out)? {
        return Ok(true);
    }
    if tensor::handle_tensor_ops(ctx, out)? {
        return Ok(true);
    }
    if activations::handle_activation_ops(ctx, out)? {
        return Ok(true);
    }
    if detection::handle_detection_ops(ctx, out)? {
        return Ok(true);
    }
    Ok(false)
}

/// Pairwise eltwise chain into the node's top: `op(b0, b1, top)` then `op(top, bi, top)`.
/// Three-input sums use the dedicated 3-way call.
pub(crate) fn eltwise_chain(ctx: &EmitContext, node: &LayerNode, out: &mut Vec<Stmt>) -> Result<(), CompileError> {
    let bottoms = ctx.bottoms(node)?;
    let top = ctx.top(node, 0)?;
    if bottoms.len() < 2 {
        return Err(ctx.invalid(node, "eltwise needs at least two inputs"));
    }
    // EReLU nodes carry no eltwise param and always sum.
    let sum = node.op() == LayerKind::ERelu || node.eltwise_operation() == 1;
    if sum && bottoms.len() == 3 {
        let mut args = bottoms;
        args.push(top);
        out.push(Stmt::cnn("eltwise_sum_3way", args));
        return Ok(());
    }
    let op = if sum { "eltwise_sum" } else { "eltwise_mul" };
    out.push(Stmt::cnn(op, vec![bottoms[0].clone(), bottoms[1].clone(), top.clone()]));
    for b in &bottoms[2..] {
        out.push(Stmt::cnn(op, vec![top.clone(), b.clone(), top.clone()]));
    }
    Ok(())
}

/// Whether `node` is compiled out when `SPEEDUP_RPN` is defined. Softmax and Reshape are only
/// affected when they work on a two-channel score map.
pub(crate) fn is_speedup_disabled(graph: &NetworkGraph, options: &CompileOptions, node: &LayerNode) -> bool {
    if !options.is_speedup_disabled(&node.name) {
        return false;
    }
    let input_channels = node.inputs.first().and_then(|b| graph.channels(b));
    let output_channels = node.outputs.first().and_then(|b| graph.channels(b));
    match node.op() {
        LayerKind::Softmax => input_channels == Some(2),
        LayerKind::Reshape => {
            (node.name.contains("score") && output_channels == Some(2))
                || (node.name.contains("prob") && input_channels == Some(2))
        }
        _ => true,
    }
}

/// Mode of a deconvolution that only upsamples by two: `(mode, padded)` where mode 0 is nearest
/// and 1 bilinear, and `padded` marks the channel-halving form.
pub(crate) fn resize_mode(graph: &NetworkGraph, node: &LayerNode) -> Option<(i64, bool)> {
    if !node.op().is_deconv() {
        return None;
    }
    let p = node.conv_param();
    let stride = p.stride.first().copied().unwrap_or(1);
    let kernel = p.kernel_size.first().copied().unwrap_or(1);
    let mode = match (kernel, p.weight_filler.as_str()) {
        (2, "constant") => 0,
        (4, "bilinear") => 1,
        _ => return None,
    };
    if stride != 2 || p.bias_term() {
        return None;
    }
    let out_channels = node
        .outputs
        .first()
        .and_then(|b| graph.channels(b))
        .or_else(|| (p.num_output > 0).then_some(p.num_output as i64))?;
    // Deconvolution kernels are laid out `[in, out / group, kh, kw]`.
    let in_channels = node
        .inputs
        .first()
        .and_then(|b| graph.channels(b))
        .or_else(|| node.weight_shape(0).and_then(|s| s.first().map(|&d| d as i64)))?;
    if p.group() as i64 != out_channels {
        return None;
    }
    if in_channels == out_channels {
        Some((mode, false))
    } else if in_channels == 2 * out_channels {
        Some((mode, true))
    } else {
        None
    }
}

pub(crate) fn const_tensors(items: Vec<Arg>) -> Arg {
    Arg::List(ListKind::ConstTensors, items)
}

pub(crate) fn tensors(items: Vec<Arg>) -> Arg {
    Arg::List(ListKind::Tensors, items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BlobShape, ConvolutionParam};

    fn graph_with(layer: LayerNode, shapes: &[(&str, i64)]) -> NetworkGraph {
        NetworkGraph {
            layers: vec![layer],
            blob_shapes: shapes
                .iter()
                .map(|(name, c)| BlobShape {
                    name: name.to_string(),
                    dims: vec![1, *c, 8, 8],
                })
                .collect(),
            ..Default::default()
        }
    }

    fn node(name: &str, kind: &str) -> LayerNode {
        LayerNode {
            name: name.to_string(),
            kind: kind.to_string(),
            inputs: vec!["x".to_string()],
            outputs: vec!["y".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_softmax_needs_two_channels() {
        let options = CompileOptions {
            speedup_disabled_layers: vec!["rpn_cls_prob".to_string()],
            ..Default::default()
        };
        let softmax = node("rpn_cls_prob", "Softmax");
        let two = graph_with(softmax.clone(), &[("x", 2), ("y", 2)]);
        assert!(is_speedup_disabled(&two, &options, &softmax));
        let many = graph_with(softmax.clone(), &[("x", 18), ("y", 18)]);
        assert!(!is_speedup_disabled(&many, &options, &softmax));

        let conv = node("rpn_cls_prob", "Convolution");
        assert!(is_speedup_disabled(&many, &options, &conv));
    }

    #[test]
    fn test_resize_mode() {
        let mut deconv = node("up", "Deconvolution");
        deconv.convolution = Some(ConvolutionParam {
            num_output: 8,
            bias_term: Some(false),
            kernel_size: vec![4],
            stride: vec![2],
            group: Some(8),
            weight_filler: "bilinear".to_string(),
            ..Default::default()
        });
        let same = graph_with(deconv.clone(), &[("x", 8), ("y", 8)]);
        assert_eq!(resize_mode(&same, &deconv), Some((1, false)));
        let halving = graph_with(deconv.clone(), &[("x", 16), ("y", 8)]);
        assert_eq!(resize_mode(&halving, &deconv), Some((1, true)));

        let mut learned = deconv.clone();
        if let Some(p) = learned.convolution.as_mut() {
            p.weight_filler = "msra".to_string();
        }
        assert_eq!(resize_mode(&same, &learned), None);
    }
}
