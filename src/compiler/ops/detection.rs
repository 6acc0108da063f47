use super::super::emit::{Arg, ListKind, Stmt, Target, Variant};
use super::super::metadata::parse_param_str;
use super::super::patterns::FusedKind;
use super::super::CompileError;
use super::{const_tensors, is_speedup_disabled, EmitContext};
use crate::model::{DetectionParam, LayerNode, RpnOption};

fn symbols(names: &[&str]) -> Vec<Arg> {
    names.iter().map(|s| Arg::symbol(*s)).collect()
}

fn braced(items: Vec<Arg>) -> Arg {
    Arg::List(ListKind::Braced, items)
}

/// Image size and detection crop geometry, shared by every post-processing call.
fn image_and_crop() -> Vec<Arg> {
    symbols(&[
        "image_width",
        "image_height",
        "det_crop_x",
        "det_crop_y",
        "det_resized_width",
        "det_resized_height",
        "det_scale_x",
        "det_scale_y",
    ])
}

fn box_coding(p: &DetectionParam) -> Vec<Arg> {
    [
        p.mean_dx, p.mean_dy, p.mean_dw, p.mean_dh, p.std_dx, p.std_dy, p.std_dw, p.std_dh,
    ]
    .into_iter()
    .map(Arg::Float)
    .collect()
}

/// `const std::vector<...> <prefix>_anchors` over the constructor's `object` tensors, plus the
/// per-level size tables of a multi-level RPN.
fn anchor_tables(prefix: &str, object: &str, rpn: &[RpnOption]) -> Vec<Stmt> {
    let anchors = (0..rpn.len())
        .map(|i| Arg::symbol(format!("&{}[{}]", object, i)))
        .collect();
    let ints = |f: fn(&RpnOption) -> u32| braced(rpn.iter().map(|o| Arg::Int(f(o) as i64)).collect());
    vec![
        Stmt::declare(
            "const std::vector<const Tensor*>",
            &format!("{}_anchors", prefix),
            braced(anchors),
        ),
        Stmt::declare(
            "const std::vector<int32_t>",
            &format!("{}_feat_stride", prefix),
            ints(|o| o.feat_stride),
        ),
        Stmt::declare(
            "const std::vector<int32_t>",
            &format!("{}_base_size", prefix),
            ints(|o| o.base_size),
        ),
        Stmt::declare(
            "const std::vector<int32_t>",
            &format!("{}_min_size", prefix),
            ints(|o| o.min_size),
        ),
        Stmt::declare(
            "const std::vector<int32_t>",
            &format!("{}_max_size", prefix),
            ints(|o| o.max_size),
        ),
    ]
}

fn anchor_table_args(prefix: &str) -> Vec<Arg> {
    ["anchors", "feat_stride", "base_size", "min_size", "max_size"]
        .iter()
        .map(|s| Arg::symbol(format!("{}_{}", prefix, s)))
        .collect()
}

fn roi_data(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<(), CompileError> {
    let node = ctx.anchor();
    let p = node.roi_data.clone().unwrap_or_default();
    out.push(Stmt::declare(
        "const float_t",
        "means[3]",
        braced(vec![Arg::Float(p.mean0), Arg::Float(p.mean1), Arg::Float(p.mean2)]),
    ));
    let mut args = symbols(&[
        "image",
        "options.DET_RESIZED_HEIGHT",
        "options.DET_RESIZED_WIDTH",
        "options.DET_ROI[0]",
        "options.DET_ROI[1]",
        "options.DET_ROI[2]",
        "options.DET_ROI[3]",
    ]);
    args.push(Arg::Int(p.multiple() as i64));
    args.push(Arg::symbol("means"));
    args.push(ctx.top(node, 0)?);
    args.extend(symbols(&[
        "det_crop_x",
        "det_crop_y",
        "det_crop_w",
        "det_crop_h",
        "det_resized_width",
        "det_resized_height",
        "det_scale_x",
        "det_scale_y",
        "options.ROUND_MULTIPLE_RATIO",
        "options.FORCED_ASPECT_RATIO",
    ]));
    out.push(Stmt::on(Target::Object("i2t->".to_string()), "set_input", args));
    Ok(())
}

/// First input of a layer outside the current window: a local blob when it has a slot, else the
/// feature map handed in by the caller.
fn source_feature(ctx: &EmitContext, node: &LayerNode) -> Result<Arg, CompileError> {
    let name = node
        .inputs
        .first()
        .ok_or_else(|| ctx.invalid(node, "missing input 0"))?;
    Ok(match ctx.tables.lookup_blob(name) {
        Some(slot) => Arg::Blob(slot),
        None => Arg::symbol(format!("feat_maps->Get(\"{}\")", name)),
    })
}

fn proposal_nway(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<(), CompileError> {
    let node = ctx.anchor();
    let rpn = node
        .proposal_nway
        .as_ref()
        .map(|p| p.rpn_option.as_slice())
        .unwrap_or_default();

    let mut scores = Vec::new();
    let mut deltas = Vec::new();
    let mut feats = Vec::new();
    let mut weights = Vec::new();
    let mut biases = Vec::new();
    for i in 0..rpn.len() {
        if i * 2 + 1 >= node.inputs.len() {
            continue;
        }
        scores.push(ctx.bottom(node, i * 2)?);
        deltas.push(ctx.bottom(node, i * 2 + 1)?);
        // The box regressor may be compiled out, in which case the deltas are computed inside
        // the proposal call from its input features and weights.
        let producer = ctx.graph.layer(&node.inputs[i * 2 + 1]);
        if let Some(producer) = producer
            && is_speedup_disabled(ctx.graph, ctx.options, producer)
        {
            feats.push(source_feature(ctx, producer)?);
            weights.push(ctx.weight(producer, 0)?);
            biases.push(ctx.weight(producer, 1)?);
        }
    }

    out.extend(anchor_tables("proposal_nway", "anchors", rpn));
    let sources_ty = "const std::vector<std::vector<const Tensor*> >";
    let plain = Stmt::declare(
        sources_ty,
        "proposal_nway_sources",
        braced(vec![const_tensors(scores.clone()), const_tensors(deltas)]),
    );
    if feats.is_empty() {
        out.push(plain);
    } else {
        let fused = Stmt::declare(
            sources_ty,
            "proposal_nway_sources",
            braced(vec![
                const_tensors(scores),
                const_tensors(feats),
                const_tensors(weights),
                const_tensors(biases),
            ]),
        );
        out.push(Stmt::Branch {
            variant: Variant::SpeedupRpn,
            enabled: vec![fused],
            disabled: vec![plain],
        });
    }

    let top = if node.outputs.len() > 1 {
        ctx.top(node, 1)?
    } else {
        ctx.top(node, 0)?
    };
    let mut args = vec![Arg::symbol("proposal_nway_sources")];
    args.extend(anchor_table_args("proposal_nway"));
    args.extend(symbols(&[
        "det_resized_width",
        "det_resized_height",
        "det_scale_x",
        "det_scale_y",
        "options.PRE_NMS_PROPOSALS",
        "options.POST_NMS_PROPOSALS",
        "options.PROPOSAL_NMS_THRES",
        "rois",
    ]));
    args.push(top);
    args.push(Arg::symbol("options.PROPOSAL_THRES"));
    out.push(Stmt::cnn("proposal_nway", args));
    Ok(())
}

const NMS_OPTIONS: [&str; 5] = [
    "options.NMS_THRES",
    "options.DETECTION_THRES1",
    "options.DETECTION_THRES2",
    "options.REFINE_THRES1",
    "options.VOTE_THRES",
];

fn detection(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<(), CompileError> {
    let node = ctx.anchor();
    let p = node.detection.clone().unwrap_or_default();
    let n = node.inputs.len();

    // Four inputs without RPN options are (cls, bbox, ..); otherwise the inputs come in
    // (cls, bbox, _) triples and the last one is the proposals.
    let (b0, b1) = if n == 4 && p.rpn_option.is_empty() {
        (ctx.bottom(node, 1)?, ctx.bottom(node, 0)?)
    } else {
        let pick = |r: usize| -> Result<Arg, CompileError> {
            let items = (0..n.saturating_sub(1))
                .filter(|b| b % 3 == r)
                .map(|b| ctx.bottom(node, b))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(const_tensors(items))
        };
        (pick(1)?, pick(0)?)
    };

    let mut args = vec![Arg::symbol("rois"), b0, b1];
    let with_rpn = !p.rpn_option.is_empty();
    if with_rpn {
        out.extend(anchor_tables("detection", "detection_anchors", &p.rpn_option));
        args.extend(anchor_table_args("detection"));
    }
    args.extend(image_and_crop());
    if !with_rpn {
        args.extend(box_coding(&p));
    }
    args.extend(symbols(&NMS_OPTIONS));
    args.extend(symbols(&[
        "restore_scale",
        "refine_size",
        "objects",
        "class_map",
        "options.SUCC_SUPPRESSED_CNT",
        "options.NMS_VOTE",
    ]));
    if !with_rpn {
        ctx.push_fc2conv(&mut args);
    }
    out.push(Stmt::cnn("get_det_output", args));
    Ok(())
}

/// Post-processing flavour of an attribute head, selected by its input count and point layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PostType {
    Post3d,
    PostNew3d,
    PostV1,
    PostV2,
    PostV3,
    PostV4,
}

impl PostType {
    fn symbol(self) -> &'static str {
        match self {
            PostType::Post3d => "POST_3D",
            PostType::PostNew3d => "POST_NEW_3D",
            PostType::PostV1 => "POST_V1",
            PostType::PostV2 => "POST_V2",
            PostType::PostV3 => "POST_V3",
            PostType::PostV4 => "POST_V4",
        }
    }
}

/// Post type plus the extra input positions appended after `rois, b1, b0`.
/// `None` when the layout is not one the operator library handles.
fn post_layout(inputs: usize, shapes: u32, pts: u32) -> Option<(PostType, Vec<usize>)> {
    let point_shape = shapes == 1 && (pts == 8 || pts == 16);
    let wide = |n: usize, regular: usize, extra: usize| -> (PostType, Vec<usize>) {
        let mut post = if regular == 5 {
            PostType::PostV3
        } else {
            PostType::PostV2
        };
        let mut picks = Vec::new();
        let mut start = 2;
        if n == extra {
            picks.push(2);
            start = 3;
            if shapes == 1 && pts == 16 {
                post = PostType::PostV4;
            }
        }
        picks.extend(start..start + regular);
        (post, picks)
    };
    match inputs {
        4 if shapes == 2 && pts == 4 => Some((PostType::Post3d, Vec::new())),
        4 if point_shape => Some((PostType::PostNew3d, Vec::new())),
        5 => Some((PostType::PostNew3d, vec![2])),
        8 if point_shape => Some(wide(8, 2, 9)),
        9 => Some(wide(9, 2, 9)),
        8 => Some((PostType::PostV1, vec![2, 3])),
        11 if point_shape => Some(wide(11, 5, 12)),
        12 => Some(wide(12, 5, 12)),
        _ => None,
    }
}

fn group_table(name: &str, text: &str) -> Stmt {
    let items = parse_param_str(text).into_iter().map(Arg::Symbol).collect();
    Stmt::declare("const int", &format!("{}[]", name), braced(items))
}

fn attribute_detection(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<bool, CompileError> {
    let node = ctx.anchor();
    let post = node.post_detection.clone().unwrap_or_default();
    let Some((post_type, extra)) = post_layout(node.inputs.len(), post.num_shape, post.num_pts) else {
        return Ok(false);
    };
    let mut sources = vec![Arg::symbol("rois"), ctx.bottom(node, 1)?, ctx.bottom(node, 0)?];
    for i in extra {
        sources.push(ctx.bottom(node, i)?);
    }
    let grouped = !matches!(post_type, PostType::Post3d | PostType::PostNew3d);
    if grouped {
        out.push(group_table("attribute_group", &post.attribute_group));
        out.push(group_table("regression_group", &post.regression_group));
    }
    let (attribute_group, regression_group) = if grouped {
        ("attribute_group", "regression_group")
    } else {
        ("NULL", "NULL")
    };

    let p = node.detection.clone().unwrap_or_default();
    let mut args = vec![const_tensors(sources), Arg::symbol(post_type.symbol())];
    args.extend(image_and_crop());
    args.extend(box_coding(&p));
    args.extend(symbols(&[attribute_group, regression_group, "restore_scale", "attributes"]));
    ctx.push_fc2conv(&mut args);
    out.push(Stmt::cnn("get_det_attribute_output", args));
    Ok(true)
}

/// Cluster and seg-map names a quantized mask pooling reads, by head.
struct MaskMaps {
    cluster_map: &'static str,
    seg_map: &'static str,
    seg_layer: &'static str,
    min_val: &'static str,
    max_val: &'static str,
}

fn mask_maps(name: &str) -> MaskMaps {
    if name.starts_with("boundary") {
        return MaskMaps {
            cluster_map: "boundary_cluster_map",
            seg_map: "boundary_seg_map",
            seg_layer: "boundary_seg_map",
            min_val: "boundary_cluster_min_val",
            max_val: "boundary_cluster_max_val",
        };
    }
    MaskMaps {
        cluster_map: "line_cluster_map",
        seg_map: "line_seg_map",
        seg_layer: if name == "ld_quantized_feature1" {
            "ld_seg_map"
        } else {
            "line_seg_map"
        },
        min_val: "cluster_min_val",
        max_val: "cluster_max_val",
    }
}

fn quantized_mask_pooling(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<(), CompileError> {
    let node = ctx.anchor();
    let maps = mask_maps(&node.name);
    let features = const_tensors(vec![ctx.bottom(node, 2)?]);
    let top = ctx.top(node, 0)?;
    // With the speedup the seg map is read from the local layer instead of the caller's copy.
    let local_seg = ctx
        .graph
        .layer(maps.seg_layer)
        .and_then(|l| l.outputs.first())
        .and_then(|b| ctx.tables.lookup_blob(b))
        .map_or_else(|| Arg::symbol(maps.seg_layer), Arg::Blob);
    let call = |seg: Arg, trailing: Option<Arg>| {
        let mut args = vec![
            Arg::symbol(maps.cluster_map),
            features.clone(),
            seg,
            Arg::symbol(maps.min_val),
            Arg::symbol(maps.max_val),
            Arg::Int(256),
            top.clone(),
        ];
        args.extend(trailing);
        Stmt::cnn("quantized_mask_pooling", args)
    };
    out.push(Stmt::Branch {
        variant: Variant::SpeedupRpn,
        enabled: vec![call(local_seg, Some(Arg::Bool(false)))],
        disabled: vec![call(Arg::symbol(maps.seg_map), None)],
    });
    Ok(())
}

pub(crate) fn handle_detection_ops(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<bool, CompileError> {
    match ctx.seg.kind {
        FusedKind::RoiData => roi_data(ctx, out)?,
        FusedKind::ProposalNway => proposal_nway(ctx, out)?,
        FusedKind::Detection => detection(ctx, out)?,
        FusedKind::AttributeDetection => return attribute_detection(ctx, out),
        FusedKind::QuantizedMaskPooling => quantized_mask_pooling(ctx, out)?,
        // Both only hand their inputs to the caller; the driver rebinds them.
        FusedKind::Segmentation | FusedKind::CurveFitting => {}
        _ => return Ok(false),
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_layouts() {
        assert_eq!(post_layout(4, 2, 4), Some((PostType::Post3d, vec![])));
        assert_eq!(post_layout(5, 0, 0), Some((PostType::PostNew3d, vec![2])));
        assert_eq!(post_layout(8, 1, 8), Some((PostType::PostV2, vec![2, 3])));
        assert_eq!(post_layout(8, 0, 0), Some((PostType::PostV1, vec![2, 3])));
        assert_eq!(post_layout(9, 1, 16), Some((PostType::PostV4, vec![2, 3, 4])));
        assert_eq!(post_layout(9, 1, 8), Some((PostType::PostV2, vec![2, 3, 4])));
        assert_eq!(
            post_layout(12, 1, 8),
            Some((PostType::PostV3, vec![2, 3, 4, 5, 6, 7]))
        );
        assert_eq!(
            post_layout(11, 1, 16),
            Some((PostType::PostV3, vec![2, 3, 4, 5, 6]))
        );
        assert_eq!(post_layout(6, 1, 8), None);
    }

    #[test]
    fn test_mask_maps_by_head() {
        assert_eq!(mask_maps("boundary_quantized_feature1").seg_layer, "boundary_seg_map");
        assert_eq!(mask_maps("ld_quantized_feature1").seg_layer, "ld_seg_map");
        assert_eq!(mask_maps("quantized_feature1").seg_layer, "line_seg_map");
    }
}
