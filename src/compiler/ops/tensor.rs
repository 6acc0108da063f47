use super::super::emit::{Arg, Stmt, Variant};
use super::super::patterns::FusedKind;
use super::super::CompileError;
use super::{const_tensors, eltwise_chain, tensors, EmitContext};

fn pooling(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<(), CompileError> {
    let node = ctx.anchor();
    let p = node.pooling_param();
    let op = if p.pool == 0 { "max_pooling" } else { "ave_pooling" };
    let input = ctx.bottom_slot(node, 0)?;
    let (kh, kw) = if p.global_pooling {
        (Arg::BlobDim(input, 3), Arg::BlobDim(input, 4))
    } else {
        (Arg::Int(p.kernel_size as i64), Arg::Int(p.kernel_size as i64))
    };
    out.push(Stmt::cnn(
        op,
        vec![
            Arg::Blob(input),
            kh,
            kw,
            Arg::Int(p.stride() as i64),
            Arg::Int(p.pad as i64),
            ctx.top(node, 0)?,
        ],
    ));
    Ok(())
}

fn stixel_pooling(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<(), CompileError> {
    let node = ctx.anchor();
    let p = node.stixel_pooling.clone().unwrap_or_default();
    let op = if p.pool == 0 {
        "max_stixelpooling"
    } else {
        "ave_stixelpooling"
    };
    let int = |v: u32| Arg::Int(v as i64);
    out.push(Stmt::cnn(
        op,
        vec![
            ctx.bottom(node, 0)?,
            Arg::Int(p.global_pooling_h as i64),
            int(p.pad_h),
            int(p.stride_h),
            int(p.bin_h),
            int(p.kernel_h),
            Arg::Int(p.global_pooling_w as i64),
            int(p.pad_w),
            int(p.stride_w),
            int(p.bin_w),
            int(p.kernel_w),
            ctx.top(node, 0)?,
            Arg::Int(0),
        ],
    ));
    Ok(())
}

fn laplacian(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<(), CompileError> {
    // Scale, Pooling, Pooling, Eltwise, Eltwise (mul), Eltwise (out).
    let pool = ctx.at(2).pooling_param();
    let mul = ctx.at(4);
    let result = ctx.at(5);
    out.push(Stmt::cnn(
        "laplacian_mask",
        vec![
            ctx.bottom(mul, 0)?,
            ctx.bottom(result, 0)?,
            ctx.bottom(ctx.anchor(), 0)?,
            Arg::Int(pool.kernel_size as i64),
            Arg::Int(pool.kernel_size as i64),
            Arg::Int(pool.stride() as i64),
            Arg::Int(pool.pad as i64),
            ctx.top(result, 0)?,
        ],
    ));
    Ok(())
}

fn concat(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<(), CompileError> {
    let node = ctx.anchor();
    let axis = node.concat.as_ref().map_or(1, |c| c.axis());
    out.push(Stmt::cnn(
        "concat",
        vec![
            const_tensors(ctx.bottoms(node)?),
            Arg::Int(axis as i64),
            ctx.top(node, 0)?,
        ],
    ));
    Ok(())
}

fn slice(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<(), CompileError> {
    let node = ctx.anchor();
    let param = node.slice.clone().unwrap_or_default();
    let points: Vec<i64> = if param.slice_points.is_empty() {
        vec![-1]
    } else {
        param.slice_points.iter().map(|&p| p as i64).collect()
    };
    out.push(Stmt::cnn(
        "slice",
        vec![
            ctx.bottom(node, 0)?,
            Arg::Int(param.axis() as i64),
            Arg::ints(points),
            tensors(ctx.tops(node)?),
        ],
    ));
    Ok(())
}

fn slice_concat(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<(), CompileError> {
    let node = ctx.anchor();
    let param = node.slice_concat.clone().unwrap_or_default();
    let parts: Vec<Arg> = (0..param.nslices)
        .map(|i| Arg::symbol(format!("tmp[{}]", i)))
        .collect();
    out.push(Stmt::Block(vec![
        Stmt::declare(
            "std::vector<Tensor>",
            "tmp",
            Arg::symbol(format!("std::vector<Tensor>({})", param.nslices)),
        ),
        Stmt::cnn(
            "slice",
            vec![
                ctx.bottom(node, 0)?,
                Arg::Int(param.slice_axis as i64),
                Arg::ints([-1]),
                tensors(parts.clone()),
            ],
        ),
        Stmt::cnn(
            "concat",
            vec![
                const_tensors(parts),
                Arg::Int(param.concat_axis as i64),
                ctx.top(node, 0)?,
            ],
        ),
    ]));
    Ok(())
}

fn reshape(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<(), CompileError> {
    let node = ctx.anchor();
    let mut dims: Vec<i64> = node
        .reshape
        .as_ref()
        .map(|r| r.dims.iter().take(4).copied().collect())
        .unwrap_or_default();
    dims.resize(4, 1);
    let call = |dims: &[i64]| -> Result<Stmt, CompileError> {
        let mut args = vec![ctx.bottom(node, 0)?];
        args.extend(dims.iter().map(|&d| Arg::Int(d)));
        args.push(ctx.top(node, 0)?);
        Ok(Stmt::cnn("reshape", args))
    };
    if ctx.options.is_folded_reshape(&node.name) {
        let mut folded = dims.clone();
        folded[1] = 1;
        out.push(Stmt::Branch {
            variant: Variant::SpeedupRpn,
            enabled: vec![call(&folded)?],
            disabled: vec![call(&dims)?],
        });
    } else {
        out.push(call(&dims)?);
    }
    Ok(())
}

fn resample(ctx: &EmitContext, op: &str, out: &mut Vec<Stmt>) -> Result<(), CompileError> {
    let node = ctx.anchor();
    let scale = Arg::Int(node.resample_scale() as i64);
    let args = if op == "resize" {
        vec![
            ctx.bottom(node, 0)?,
            scale.clone(),
            scale,
            Arg::Int(0),
            ctx.top(node, 0)?,
        ]
    } else {
        vec![ctx.bottom(node, 0)?, scale, ctx.top(node, 0)?]
    };
    out.push(Stmt::cnn(op, args));
    Ok(())
}

pub(crate) fn handle_tensor_ops(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<bool, CompileError> {
    match ctx.seg.kind {
        FusedKind::Eltwise => eltwise_chain(ctx, ctx.anchor(), out)?,
        FusedKind::Pooling => pooling(ctx, out)?,
        FusedKind::StixelPooling => stixel_pooling(ctx, out)?,
        FusedKind::Laplacian => laplacian(ctx, out)?,
        FusedKind::Concat => concat(ctx, out)?,
        FusedKind::Slice => slice(ctx, out)?,
        FusedKind::SliceConcat => slice_concat(ctx, out)?,
        FusedKind::Reshape => reshape(ctx, out)?,
        FusedKind::Upsample => resample(ctx, "resize", out)?,
        FusedKind::Space2Depth => resample(ctx, "space2depth", out)?,
        FusedKind::Depth2Space => resample(ctx, "depth2space", out)?,
        // Outputs share the input slot; nothing to run.
        FusedKind::Split => {}
        _ => return Ok(false),
    }
    Ok(true)
}
