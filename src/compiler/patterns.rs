use super::CompileError;
use crate::model::{LayerKind, LayerNode};
use std::ops::Range;
use tracing::debug;

/// Target operator a matched window lowers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FusedKind {
    RoiData,
    RoiPooling3x3WayMultiOut,
    RoiPooling3x3Way,
    PsRoiPooling3Way,
    PsRoiPooling,
    RoiPooling3Way,
    RoiPooling,
    Laplacian,
    /// Five slices feeding a 4x4 grid of convs whose outputs five concats stitch back together.
    GridConv,
    ConvEltwiseRelu,
    ConvRelu,
    Conv,
    Deconv,
    InnerProduct,
    CRelu,
    Scale,
    Relu,
    ERelu,
    Elu,
    Mish,
    Eltwise,
    Pooling,
    StixelPooling,
    Concat,
    Slice,
    SliceConcat,
    Reshape,
    Softmax,
    Sigmoid,
    Split,
    Upsample,
    Space2Depth,
    Depth2Space,
    ProposalNway,
    Detection,
    AttributeDetection,
    Segmentation,
    CurveFitting,
    QuantizedMaskPooling,
    /// No pattern claimed the node.
    Unknown,
}

impl FusedKind {
    /// Kinds whose anchor owns weight tensors that get transformed and written.
    pub fn is_weight_bearing(self) -> bool {
        matches!(
            self,
            Self::Conv
                | Self::ConvRelu
                | Self::ConvEltwiseRelu
                | Self::Deconv
                | Self::InnerProduct
                | Self::Scale
        )
    }
}

/// Role nodes of one match, as absolute graph positions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roles {
    pub consumed: usize,
    pub batch_norm: Option<usize>,
    pub scale: Option<usize>,
    pub eltwise: Option<usize>,
    pub relu: Option<usize>,
    /// Fan-in members, in graph order.
    pub members: Vec<usize>,
    /// Nodes whose tops are the fused operator's outputs.
    pub outputs: Vec<usize>,
}

impl Roles {
    fn single() -> Self {
        Self {
            consumed: 1,
            ..Default::default()
        }
    }

    fn span(anchor: usize, len: usize) -> Self {
        Self {
            consumed: len,
            members: (anchor..anchor + len).collect(),
            ..Default::default()
        }
    }
}

pub type PatternMatcher = Box<dyn Fn(&[LayerNode], usize) -> Option<Roles> + Send + Sync>;

pub struct Pattern {
    pub name: String,
    pub kind: FusedKind,
    pub matcher: PatternMatcher,
}

impl Pattern {
    pub fn new<M>(name: &str, kind: FusedKind, matcher: M) -> Self
    where
        M: Fn(&[LayerNode], usize) -> Option<Roles> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            kind,
            matcher: Box::new(matcher),
        }
    }
}

/// One claimed window of the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedPattern {
    pub anchor: usize,
    pub kind: FusedKind,
    pub name: String,
    pub roles: Roles,
}

impl FusedPattern {
    fn unknown(anchor: usize) -> Self {
        Self {
            anchor,
            kind: FusedKind::Unknown,
            name: "Unknown".to_string(),
            roles: Roles::single(),
        }
    }

    pub fn span(&self) -> Range<usize> {
        self.anchor..self.anchor + self.roles.consumed
    }
}

fn kind_at(layers: &[LayerNode], i: usize) -> Option<LayerKind> {
    layers.get(i).map(LayerNode::op)
}

fn is_at(layers: &[LayerNode], i: usize, kind: LayerKind) -> bool {
    kind_at(layers, i) == Some(kind)
}

fn run_of(layers: &[LayerNode], start: usize, kinds: &[LayerKind]) -> bool {
    kinds
        .iter()
        .enumerate()
        .all(|(k, kind)| is_at(layers, start + k, kind.clone()))
}

/// Optional `BatchNorm [Scale]` after position `i - 1`. The Scale is absorbed only when the
/// BatchNorm carries exactly three tensors; otherwise the BatchNorm has its own affine terms.
/// Returns the roles and the first position after the tail.
pub(crate) fn bn_tail(layers: &[LayerNode], i: usize) -> (Option<usize>, Option<usize>, usize) {
    if !is_at(layers, i, LayerKind::BatchNorm) {
        return (None, None, i);
    }
    if layers[i].weights.len() == 3 && is_at(layers, i + 1, LayerKind::Scale) {
        (Some(i), Some(i + 1), i + 2)
    } else {
        (Some(i), None, i + 1)
    }
}

fn weighted(layers: &[LayerNode], anchor: usize, accept: fn(&LayerKind) -> bool) -> Option<Roles> {
    let kind = kind_at(layers, anchor)?;
    if !accept(&kind) {
        return None;
    }
    let (batch_norm, scale, next) = bn_tail(layers, anchor + 1);
    Some(Roles {
        consumed: next - anchor,
        batch_norm,
        scale,
        ..Default::default()
    })
}

fn roi_group() -> Vec<LayerKind> {
    vec![
        LayerKind::RoiPooling,
        LayerKind::RoiPooling,
        LayerKind::RoiPooling,
        LayerKind::Concat,
    ]
}

fn ps_group() -> Vec<LayerKind> {
    vec![
        LayerKind::PsRoiPooling,
        LayerKind::Pooling,
        LayerKind::Reshape,
    ]
}

fn repeated(group: &[LayerKind], times: usize) -> Vec<LayerKind> {
    (0..times).flat_map(|_| group.iter().cloned()).collect()
}

fn single(kind: LayerKind) -> impl Fn(&[LayerNode], usize) -> Option<Roles> + Send + Sync {
    move |layers, i| is_at(layers, i, kind.clone()).then(Roles::single)
}

fn roi_3x3_multi_out(layers: &[LayerNode], a: usize) -> Option<Roles> {
    let mut kinds = repeated(&roi_group(), 3);
    kinds.extend(vec![LayerKind::ProposalSlice; 3]);
    if !run_of(layers, a, &kinds) {
        return None;
    }
    let mut roles = Roles::span(a, 15);
    roles.outputs = vec![a + 12, a + 13, a + 14];
    Some(roles)
}

fn roi_3x3(layers: &[LayerNode], a: usize) -> Option<Roles> {
    if !run_of(layers, a, &repeated(&roi_group(), 3)) {
        return None;
    }
    let mut roles = Roles::span(a, 12);
    roles.outputs = vec![a + 3, a + 7, a + 11];
    Some(roles)
}

fn ps_roi_3way(layers: &[LayerNode], a: usize) -> Option<Roles> {
    let mut kinds = repeated(&ps_group(), 6);
    kinds.extend([LayerKind::Eltwise, LayerKind::Eltwise]);
    if !run_of(layers, a, &kinds) {
        return None;
    }
    let mut roles = Roles::span(a, 20);
    roles.outputs = vec![a + 18, a + 19];
    Some(roles)
}

fn ps_roi(layers: &[LayerNode], a: usize) -> Option<Roles> {
    if !run_of(layers, a, &repeated(&ps_group(), 2)) {
        return None;
    }
    let mut roles = Roles::span(a, 6);
    roles.outputs = vec![a + 2, a + 5];
    Some(roles)
}

fn roi_3way(layers: &[LayerNode], a: usize) -> Option<Roles> {
    if !run_of(layers, a, &roi_group()) {
        return None;
    }
    let mut roles = Roles::span(a, 4);
    roles.outputs = vec![a + 3];
    Some(roles)
}

fn laplacian(layers: &[LayerNode], a: usize) -> Option<Roles> {
    let kinds = [
        LayerKind::Scale,
        LayerKind::Pooling,
        LayerKind::Pooling,
        LayerKind::Eltwise,
        LayerKind::Eltwise,
        LayerKind::Eltwise,
    ];
    if !run_of(layers, a, &kinds) {
        return None;
    }
    let mut roles = Roles::span(a, 6);
    roles.outputs = vec![a + 5];
    Some(roles)
}

const GRID_SLICES: usize = 5;
const GRID_CONVS: usize = 16;
pub const GRID_CONV_LEN: usize = GRID_SLICES + GRID_CONVS + 5;

/// Role of position `offset` inside a grid-conv block.
fn grid_cell(offset: usize) -> FusedKind {
    if offset < GRID_SLICES {
        FusedKind::Slice
    } else if offset < GRID_SLICES + GRID_CONVS {
        FusedKind::Conv
    } else {
        FusedKind::Concat
    }
}

fn grid_conv(layers: &[LayerNode], a: usize) -> Option<Roles> {
    let fits = (0..GRID_CONV_LEN).all(|k| match grid_cell(k) {
        FusedKind::Slice => is_at(layers, a + k, LayerKind::Slice),
        // Each cell is a bare conv; a batch-norm tail would swallow the next cell.
        FusedKind::Conv => weighted(layers, a + k, LayerKind::is_conv).is_some_and(|r| r.consumed == 1),
        _ => is_at(layers, a + k, LayerKind::Concat),
    });
    if !fits {
        return None;
    }
    let mut roles = Roles::span(a, GRID_CONV_LEN);
    roles.outputs = vec![a + GRID_CONV_LEN - 1];
    Some(roles)
}

/// The single-node segments a grid-conv block lowers to when the fused call is unavailable.
pub fn grid_conv_members(seg: &FusedPattern) -> Vec<FusedPattern> {
    seg.roles
        .members
        .iter()
        .enumerate()
        .map(|(k, &p)| {
            let kind = grid_cell(k);
            FusedPattern {
                anchor: p,
                kind,
                name: format!("{:?}", kind),
                roles: Roles::single(),
            }
        })
        .collect()
}

fn conv_eltwise_relu(layers: &[LayerNode], a: usize) -> Option<Roles> {
    let mut roles = weighted(layers, a, LayerKind::is_conv)?;
    let j = a + roles.consumed;
    if is_at(layers, j, LayerKind::ERelu) {
        roles.eltwise = Some(j);
        roles.relu = Some(j);
        roles.consumed += 1;
    } else if is_at(layers, j, LayerKind::Eltwise) && is_at(layers, j + 1, LayerKind::Relu) {
        roles.eltwise = Some(j);
        roles.relu = Some(j + 1);
        roles.consumed += 2;
    } else {
        return None;
    }
    Some(roles)
}

fn conv_relu(layers: &[LayerNode], a: usize) -> Option<Roles> {
    let mut roles = weighted(layers, a, LayerKind::is_conv)?;
    let j = a + roles.consumed;
    if !is_at(layers, j, LayerKind::Relu) {
        return None;
    }
    roles.relu = Some(j);
    roles.consumed += 1;
    Some(roles)
}

fn crelu(layers: &[LayerNode], a: usize) -> Option<Roles> {
    if is_at(layers, a, LayerKind::CRelu) {
        return Some(Roles::single());
    }
    if !run_of(
        layers,
        a,
        &[LayerKind::Scale, LayerKind::Concat, LayerKind::Relu],
    ) {
        return None;
    }
    let mut roles = Roles::span(a, 3);
    roles.relu = Some(a + 2);
    Some(roles)
}

fn eltwise(layers: &[LayerNode], a: usize) -> Option<Roles> {
    // MAX has no operator counterpart.
    (is_at(layers, a, LayerKind::Eltwise) && layers[a].eltwise_operation() <= 1).then(Roles::single)
}

fn pooling(layers: &[LayerNode], a: usize) -> Option<Roles> {
    (is_at(layers, a, LayerKind::Pooling) && layers[a].pooling_param().pool <= 1).then(Roles::single)
}

fn stixel_pooling(layers: &[LayerNode], a: usize) -> Option<Roles> {
    (is_at(layers, a, LayerKind::StixelPooling)
        && layers[a].stixel_pooling.as_ref().map_or(0, |p| p.pool) <= 1)
        .then(Roles::single)
}

fn attribute_detection(layers: &[LayerNode], a: usize) -> Option<Roles> {
    matches!(
        kind_at(layers, a),
        Some(LayerKind::Detection3D | LayerKind::PostDetection)
    )
    .then(Roles::single)
}

/// Built-in patterns, most specific first.
pub fn get_default_patterns() -> Vec<Pattern> {
    use FusedKind as F;
    vec![
        Pattern::new("ROIData", F::RoiData, single(LayerKind::RoiData)),
        Pattern::new(
            "ROIPooling 3x3-way multi-output",
            F::RoiPooling3x3WayMultiOut,
            roi_3x3_multi_out,
        ),
        Pattern::new("ROIPooling 3x3-way", F::RoiPooling3x3Way, roi_3x3),
        Pattern::new("PSROIPooling 3-way", F::PsRoiPooling3Way, ps_roi_3way),
        Pattern::new("PSROIPooling", F::PsRoiPooling, ps_roi),
        Pattern::new("ROIPooling 3-way", F::RoiPooling3Way, roi_3way),
        Pattern::new("ROIPooling", F::RoiPooling, single(LayerKind::RoiPooling)),
        Pattern::new("Laplacian mask", F::Laplacian, laplacian),
        Pattern::new("Grid conv", F::GridConv, grid_conv),
        Pattern::new("Conv Eltwise ReLU", F::ConvEltwiseRelu, conv_eltwise_relu),
        Pattern::new("Conv ReLU", F::ConvRelu, conv_relu),
        Pattern::new("Conv", F::Conv, |layers, a| {
            weighted(layers, a, LayerKind::is_conv)
        }),
        Pattern::new("Deconv", F::Deconv, |layers, a| {
            weighted(layers, a, LayerKind::is_deconv)
        }),
        Pattern::new("InnerProduct", F::InnerProduct, |layers, a| {
            weighted(layers, a, LayerKind::is_fc)
        }),
        Pattern::new("CReLU", F::CRelu, crelu),
        Pattern::new("Scale", F::Scale, |layers, a| {
            weighted(layers, a, |k| *k == LayerKind::Scale)
        }),
        Pattern::new("ReLU", F::Relu, single(LayerKind::Relu)),
        Pattern::new("EReLU", F::ERelu, single(LayerKind::ERelu)),
        Pattern::new("ELU", F::Elu, single(LayerKind::Elu)),
        Pattern::new("Mish", F::Mish, single(LayerKind::Mish)),
        Pattern::new("Eltwise", F::Eltwise, eltwise),
        Pattern::new("Pooling", F::Pooling, pooling),
        Pattern::new("StixelPooling", F::StixelPooling, stixel_pooling),
        Pattern::new("Concat", F::Concat, single(LayerKind::Concat)),
        Pattern::new("Slice", F::Slice, single(LayerKind::Slice)),
        Pattern::new("SliceConcat", F::SliceConcat, single(LayerKind::SliceConcat)),
        Pattern::new("Reshape", F::Reshape, single(LayerKind::Reshape)),
        Pattern::new("Softmax", F::Softmax, single(LayerKind::Softmax)),
        Pattern::new("Sigmoid", F::Sigmoid, single(LayerKind::Sigmoid)),
        Pattern::new("Split", F::Split, single(LayerKind::Split)),
        Pattern::new("Upsample", F::Upsample, single(LayerKind::Upsample)),
        Pattern::new("Space2Depth", F::Space2Depth, single(LayerKind::Space2Depth)),
        Pattern::new("Depth2Space", F::Depth2Space, single(LayerKind::Depth2Space)),
        Pattern::new("ProposalNway", F::ProposalNway, single(LayerKind::ProposalNway)),
        Pattern::new("Detection", F::Detection, single(LayerKind::Detection)),
        Pattern::new(
            "Attribute detection",
            F::AttributeDetection,
            attribute_detection,
        ),
        Pattern::new("Segmentation", F::Segmentation, single(LayerKind::Segmentation)),
        Pattern::new("CurveFitting", F::CurveFitting, single(LayerKind::CurveFitting)),
        Pattern::new(
            "QuantizedMaskPooling",
            F::QuantizedMaskPooling,
            single(LayerKind::QuantizedMaskPooling),
        ),
    ]
}

/// Greedy left-to-right segmentation of the whole graph. At every unclaimed position the first
/// matching pattern wins and claims its span; positions no pattern accepts become one-node
/// `Unknown` segments.
pub fn segment(layers: &[LayerNode], patterns: &[Pattern]) -> Result<Vec<FusedPattern>, CompileError> {
    let mut segments = Vec::new();
    let mut pos = 0;
    while pos < layers.len() {
        let found = patterns.iter().find_map(|p| {
            (p.matcher)(layers, pos)
                .filter(|r| r.consumed > 0 && pos + r.consumed <= layers.len())
                .map(|r| (p, r))
        });
        let seg = match found {
            Some((pattern, roles)) => {
                debug!(
                    "Matched {} at {} ({} nodes)",
                    pattern.name, layers[pos].name, roles.consumed
                );
                FusedPattern {
                    anchor: pos,
                    kind: pattern.kind,
                    name: pattern.name.clone(),
                    roles,
                }
            }
            None => FusedPattern::unknown(pos),
        };
        pos += seg.roles.consumed;
        segments.push(seg);
    }
    claim_owners(&segments, layers.len())?;
    Ok(segments)
}

/// Index of the segment owning each position. Fails unless every position is claimed by
/// exactly one segment.
pub fn claim_owners(segments: &[FusedPattern], len: usize) -> Result<Vec<usize>, CompileError> {
    let mut owner = vec![None; len];
    for (s, seg) in segments.iter().enumerate() {
        for p in seg.span() {
            match owner.get_mut(p) {
                Some(slot) if slot.is_none() => *slot = Some(s),
                _ => return Err(CompileError::AmbiguousMatch { position: p }),
            }
        }
    }
    owner
        .into_iter()
        .enumerate()
        .map(|(p, o)| o.ok_or(CompileError::AmbiguousMatch { position: p }))
        .collect()
}
