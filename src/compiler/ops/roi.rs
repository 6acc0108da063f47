use super::super::emit::{Arg, Stmt};
use super::super::patterns::FusedKind;
use super::super::CompileError;
use super::{tensors, EmitContext};
use crate::model::LayerNode;

const ROIS: &str = "rois";

fn pool_type(ctx: &EmitContext, node: &LayerNode) -> Result<Arg, CompileError> {
    let name = match node.roi_param().pool {
        0 => "MAX_POOL",
        1 => "AVE_POOL",
        2 => "ALIGN_MAX_POOL",
        other => return Err(ctx.invalid(node, format!("unsupported roi pooling type {}", other))),
    };
    Ok(Arg::symbol(name))
}

fn output_top(ctx: &EmitContext, k: usize) -> Result<Arg, CompileError> {
    let pos = ctx
        .seg
        .roles
        .outputs
        .get(k)
        .copied()
        .ok_or_else(|| ctx.invalid(ctx.anchor(), format!("fan-in output {} missing", k)))?;
    ctx.top(ctx.node(pos), 0)
}

/// `(pw, ph, s, s / 2, s / 4)` of a three-level pyramid read by one call.
fn pyramid(node: &LayerNode) -> [Arg; 5] {
    let p = node.roi_param();
    let s = p.spatial_scale();
    [
        Arg::Int(p.pooled_w as i64),
        Arg::Int(p.pooled_h as i64),
        Arg::Float(s),
        Arg::Float(s / 2.0),
        Arg::Float(s / 4.0),
    ]
}

fn finish(ctx: &EmitContext, op: &str, mut args: Vec<Arg>, out: &mut Vec<Stmt>) -> Result<(), CompileError> {
    ctx.push_fc2conv(&mut args);
    args.push(pool_type(ctx, ctx.anchor())?);
    out.push(Stmt::cnn(op, args));
    Ok(())
}

fn roi_pooling(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<(), CompileError> {
    let node = ctx.anchor();
    let p = node.roi_param();
    let args = vec![
        ctx.feature(node, 0)?,
        Arg::symbol(ROIS),
        Arg::Int(p.pooled_w as i64),
        Arg::Int(p.pooled_h as i64),
        Arg::Float(p.spatial_scale()),
        ctx.top(node, 0)?,
    ];
    finish(ctx, "roi_pooling", args, out)
}

fn roi_pooling_3way(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<(), CompileError> {
    let mut args = Vec::new();
    for k in 0..3 {
        args.push(ctx.feature(ctx.at(k), 0)?);
    }
    args.push(Arg::symbol(ROIS));
    args.extend(pyramid(ctx.anchor()));
    args.push(output_top(ctx, 0)?);
    finish(ctx, "roi_pooling_3way", args, out)
}

fn roi_pooling_3x3way(ctx: &EmitContext, multi_out: bool, out: &mut Vec<Stmt>) -> Result<(), CompileError> {
    let mut args = Vec::new();
    for k in 0..3 {
        args.push(ctx.feature(ctx.at(k), 0)?);
    }
    args.push(Arg::symbol(ROIS));
    // One representative per group of four: its pooled size applies to the whole group.
    let groups = [ctx.at(0), ctx.at(4), ctx.at(8)];
    for g in groups {
        args.push(Arg::Int(g.roi_param().pooled_h as i64));
    }
    for g in groups {
        args.push(Arg::Int(g.roi_param().pooled_w as i64));
    }
    for k in 0..3 {
        args.push(Arg::Float(ctx.at(k).roi_param().spatial_scale()));
    }
    for k in 0..3 {
        if multi_out {
            let pos = ctx.seg.roles.outputs.get(k).copied().ok_or_else(|| {
                ctx.invalid(ctx.anchor(), format!("fan-in output {} missing", k))
            })?;
            args.push(tensors(ctx.tops(ctx.node(pos))?));
        } else {
            args.push(output_top(ctx, k)?);
        }
    }
    finish(ctx, "roi_pooling_3x3way", args, out)
}

fn ps_roi_pooling(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<(), CompileError> {
    let p = ctx.anchor().roi_param();
    for (k, offset) in [0usize, 3].into_iter().enumerate() {
        out.push(Stmt::cnn(
            "ps_roi_pooling",
            vec![
                ctx.feature(ctx.at(offset), 0)?,
                Arg::symbol(ROIS),
                Arg::Int(p.pooled_w as i64),
                Arg::Int(p.pooled_h as i64),
                Arg::Float(p.spatial_scale()),
                output_top(ctx, k)?,
            ],
        ));
    }
    Ok(())
}

fn ps_roi_pooling_3way(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<(), CompileError> {
    // Six (PSROI, Pooling, Reshape) groups; even groups feed the first output, odd the second.
    for (k, start) in [0usize, 1].into_iter().enumerate() {
        let mut args = Vec::new();
        for group in [start, start + 2, start + 4] {
            args.push(ctx.feature(ctx.at(group * 3), 0)?);
        }
        args.push(Arg::symbol(ROIS));
        args.extend(pyramid(ctx.anchor()));
        args.push(output_top(ctx, k)?);
        out.push(Stmt::cnn("ps_roi_pooling_3way", args));
    }
    Ok(())
}

pub(crate) fn handle_roi_ops(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<bool, CompileError> {
    match ctx.seg.kind {
        FusedKind::RoiPooling => roi_pooling(ctx, out)?,
        FusedKind::RoiPooling3Way => roi_pooling_3way(ctx, out)?,
        FusedKind::RoiPooling3x3Way => roi_pooling_3x3way(ctx, false, out)?,
        FusedKind::RoiPooling3x3WayMultiOut => roi_pooling_3x3way(ctx, true, out)?,
        FusedKind::PsRoiPooling => ps_roi_pooling(ctx, out)?,
        FusedKind::PsRoiPooling3Way => ps_roi_pooling_3way(ctx, out)?,
        _ => return Ok(false),
    }
    Ok(true)
}
