use super::super::emit::{Arg, ListKind, Stmt};
use super::super::patterns::{FusedKind, GRID_CONV_LEN};
use super::super::CompileError;
use super::{eltwise_chain, resize_mode, EmitContext};
use crate::model::{LayerKind, LayerNode};

/// Spatial arguments of a conv call in operator order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConvGeometry {
    pub stride_h: u32,
    pub stride_w: u32,
    pub pad_h: u32,
    pub pad_w: u32,
    pub group: u32,
    pub dilation: u32,
}

impl ConvGeometry {
    pub fn of(node: &LayerNode) -> Self {
        let p = node.conv_param();
        let stride = p.stride.first().copied().unwrap_or(1);
        let pad = p.pad.first().copied().unwrap_or(0);
        let pick = |hw: u32, fallback: u32| if hw > 0 { hw } else { fallback };
        // Explicit h/w values only count when at least one of the pair is set.
        let (stride_h, stride_w) = if p.stride_h != 0 || p.stride_w != 0 {
            (pick(p.stride_h, stride), pick(p.stride_w, stride))
        } else {
            (stride, stride)
        };
        let (pad_h, pad_w) = if p.pad_h != 0 || p.pad_w != 0 {
            (p.pad_h, p.pad_w)
        } else {
            (pad, pad)
        };
        Self {
            stride_h,
            stride_w,
            pad_h,
            pad_w,
            group: p.group(),
            dilation: p.dilation.first().copied().unwrap_or(1),
        }
    }

    fn spatial(&self) -> [Arg; 4] {
        [
            Arg::Int(self.stride_h as i64),
            Arg::Int(self.stride_w as i64),
            Arg::Int(self.pad_h as i64),
            Arg::Int(self.pad_w as i64),
        ]
    }
}

/// Top of the last node folded into the anchor; BatchNorm and Scale may write out of place.
fn fused_top(ctx: &EmitContext) -> Result<usize, CompileError> {
    let roles = &ctx.seg.roles;
    let last = roles.scale.or(roles.batch_norm).unwrap_or(ctx.seg.anchor);
    ctx.top_slot(ctx.node(last), 0)
}

fn conv_head(ctx: &EmitContext, g: &ConvGeometry) -> Result<Vec<Arg>, CompileError> {
    let anchor = ctx.anchor();
    let mut args = vec![
        ctx.bottom(anchor, 0)?,
        ctx.weight(anchor, 0)?,
        ctx.weight(anchor, 1)?,
    ];
    args.extend(g.spatial());
    args.push(Arg::Int(g.group as i64));
    args.push(Arg::Int(g.dilation as i64));
    Ok(args)
}

fn plain_conv(ctx: &EmitContext, g: &ConvGeometry, out: &mut Vec<Stmt>) -> Result<usize, CompileError> {
    let top = fused_top(ctx)?;
    let mut args = conv_head(ctx, g)?;
    args.push(Arg::Bool(ctx.bias_term));
    args.push(Arg::Blob(top));
    out.push(Stmt::cnn("conv", args));
    Ok(top)
}

fn relu_node<'a>(ctx: &EmitContext<'a>) -> Result<&'a LayerNode, CompileError> {
    ctx.seg
        .roles
        .relu
        .map(|r| ctx.node(r))
        .ok_or_else(|| ctx.invalid(ctx.anchor(), "fused relu role missing"))
}

fn conv_relu(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<(), CompileError> {
    let g = ConvGeometry::of(ctx.anchor());
    let relu = relu_node(ctx)?;
    let relu_top = ctx.top(relu, 0)?;
    if ctx.bias_term && fused_top(ctx)? == ctx.bottom_slot(relu, 0)? {
        let mut args = conv_head(ctx, &g)?;
        args.push(relu_top);
        out.push(Stmt::cnn("conv_bias_relu", args));
        return Ok(());
    }
    plain_conv(ctx, &g, out)?;
    out.push(Stmt::cnn("relu", vec![relu_top, Arg::Int(0)]));
    Ok(())
}

fn conv_eltwise_relu(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<(), CompileError> {
    let g = ConvGeometry::of(ctx.anchor());
    let eltwise = ctx
        .seg
        .roles
        .eltwise
        .map(|e| ctx.node(e))
        .ok_or_else(|| ctx.invalid(ctx.anchor(), "fused eltwise role missing"))?;
    let relu = relu_node(ctx)?;
    let relu_top = ctx.top(relu, 0)?;
    let conv_top = fused_top(ctx)?;

    let erelu = eltwise.op() == LayerKind::ERelu;
    let sum = erelu || eltwise.eltwise_operation() == 1;
    let feeds_relu = erelu || ctx.top_slot(eltwise, 0)? == ctx.bottom_slot(relu, 0)?;
    if ctx.bias_term && sum && feeds_relu && eltwise.inputs.len() == 2 {
        let (a, b) = (ctx.bottom_slot(eltwise, 0)?, ctx.bottom_slot(eltwise, 1)?);
        let residual = if a == conv_top {
            Some(b)
        } else if b == conv_top {
            Some(a)
        } else {
            None
        };
        if let Some(residual) = residual {
            let mut args = conv_head(ctx, &g)?;
            args.push(Arg::Blob(residual));
            args.push(relu_top);
            out.push(Stmt::cnn("conv_bias_add_relu", args));
            return Ok(());
        }
    }
    plain_conv(ctx, &g, out)?;
    eltwise_chain(ctx, eltwise, out)?;
    out.push(Stmt::cnn("relu", vec![relu_top, Arg::Int(0)]));
    Ok(())
}

fn deconv(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<(), CompileError> {
    let anchor = ctx.anchor();
    if let Some((mode, padded)) = resize_mode(ctx.graph, anchor) {
        let op = if padded { "resize_padd" } else { "resize" };
        out.push(Stmt::cnn(
            op,
            vec![
                ctx.bottom(anchor, 0)?,
                Arg::Int(2),
                Arg::Int(2),
                Arg::Int(mode),
                Arg::Blob(fused_top(ctx)?),
            ],
        ));
        return Ok(());
    }
    let g = ConvGeometry::of(anchor);
    let mut args = vec![
        ctx.bottom(anchor, 0)?,
        ctx.weight(anchor, 0)?,
        ctx.weight(anchor, 1)?,
    ];
    args.extend(g.spatial());
    args.push(Arg::Int(g.group as i64));
    args.push(Arg::Bool(ctx.bias_term));
    args.push(Arg::Blob(fused_top(ctx)?));
    out.push(Stmt::cnn("deconv", args));
    Ok(())
}

fn inner_product(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<(), CompileError> {
    let anchor = ctx.anchor();
    let mut args = vec![
        ctx.bottom(anchor, 0)?,
        ctx.weight(anchor, 0)?,
        ctx.weight(anchor, 1)?,
    ];
    let binary = anchor.op().is_binary();
    if binary {
        args.push(ctx.weight(anchor, 2)?);
    }
    args.push(Arg::Bool(ctx.bias_term));
    args.push(Arg::Blob(fused_top(ctx)?));
    ctx.push_fc2conv(&mut args);
    out.push(Stmt::cnn(if binary { "binary_fc" } else { "fc" }, args));
    Ok(())
}

fn scale(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<(), CompileError> {
    let anchor = ctx.anchor();
    out.push(Stmt::cnn(
        "scale",
        vec![
            ctx.bottom(anchor, 0)?,
            ctx.weight(anchor, 0)?,
            ctx.weight(anchor, 1)?,
            Arg::Bool(ctx.bias_term),
            Arg::Blob(fused_top(ctx)?),
        ],
    ));
    Ok(())
}

/// One `grid_conv` over a 4x4 conv grid. Kernels are listed column by column, reading the
/// row-major cells after the five slices.
fn grid_conv(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<(), CompileError> {
    let mut weights = Vec::new();
    let mut biases = Vec::new();
    for col in 0..4 {
        for row in 0..4 {
            let slot = ctx.layer_slot(ctx.at(5 + row * 4 + col))?;
            weights.push(Arg::Weight(slot, 0));
            biases.push(Arg::Weight(slot, 1));
        }
    }
    let tensors = "const std::vector<const Tensor*>";
    out.push(Stmt::declare(tensors, "weights", Arg::List(ListKind::ConstTensors, weights)));
    out.push(Stmt::declare(tensors, "biases", Arg::List(ListKind::ConstTensors, biases)));
    let mut args = vec![
        ctx.bottom(ctx.anchor(), 0)?,
        Arg::symbol("weights"),
        Arg::symbol("biases"),
    ];
    args.extend([4, 4, 1, 0, 1, 1, 1].map(Arg::Int));
    args.push(ctx.top(ctx.at(GRID_CONV_LEN - 1), 0)?);
    out.push(Stmt::cnn("grid_conv", args));
    Ok(())
}

pub(crate) fn handle_conv_ops(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<bool, CompileError> {
    match ctx.seg.kind {
        FusedKind::Conv => {
            plain_conv(ctx, &ConvGeometry::of(ctx.anchor()), out)?;
        }
        FusedKind::ConvRelu => conv_relu(ctx, out)?,
        FusedKind::ConvEltwiseRelu => conv_eltwise_relu(ctx, out)?,
        FusedKind::Deconv => deconv(ctx, out)?,
        FusedKind::InnerProduct => inner_product(ctx, out)?,
        FusedKind::Scale => scale(ctx, out)?,
        FusedKind::GridConv => grid_conv(ctx, out)?,
        _ => return Ok(false),
    }
    Ok(true)
}
