use super::super::emit::{Arg, Stmt};
use super::super::patterns::FusedKind;
use super::super::CompileError;
use super::{eltwise_chain, EmitContext};

pub(crate) fn handle_activation_ops(ctx: &EmitContext, out: &mut Vec<Stmt>) -> Result<bool, CompileError> {
    let node = ctx.anchor();
    match ctx.seg.kind {
        FusedKind::Relu => out.push(Stmt::cnn("relu", vec![ctx.top(node, 0)?, Arg::Int(0)])),
        FusedKind::Elu => out.push(Stmt::cnn("elu", vec![ctx.top(node, 0)?, Arg::Int(1)])),
        FusedKind::Mish => out.push(Stmt::cnn("mish", vec![ctx.top(node, 0)?])),
        FusedKind::ERelu => {
            eltwise_chain(ctx, node, out)?;
            out.push(Stmt::cnn("relu", vec![ctx.top(node, 0)?, Arg::Int(0)]));
        }
        FusedKind::CRelu => {
            // Either a native CReLU node or Scale(-1), Concat, ReLU.
            let last = ctx.at(ctx.seg.roles.consumed - 1);
            out.push(Stmt::cnn("crelu", vec![ctx.bottom(node, 0)?, ctx.top(last, 0)?]));
        }
        FusedKind::Softmax => {
            let mut args = vec![ctx.bottom(node, 0)?, ctx.top(node, 0)?];
            ctx.push_fc2conv(&mut args);
            out.push(Stmt::cnn("softmax", args));
        }
        FusedKind::Sigmoid => out.push(Stmt::cnn("sigmoid", vec![ctx.bottom(node, 0)?, ctx.top(node, 0)?])),
        _ => return Ok(false),
    }
    Ok(true)
}
