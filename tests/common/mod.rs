#![allow(dead_code)]

use netforge::compiler::{CompilationResult, Compiler, WindowSpec};
use netforge::config::CompileOptions;
use netforge::model::{BatchNormParam, LayerNode, NetworkGraph, WeightBlob};

pub fn blob(shape: Vec<i64>, data: Vec<f32>) -> WeightBlob {
    WeightBlob { shape, data }
}

pub fn layer(name: &str, kind: &str, inputs: &[&str], outputs: &[&str]) -> LayerNode {
    LayerNode {
        name: name.to_string(),
        kind: kind.to_string(),
        inputs: inputs.iter().map(|s| s.to_string()).collect(),
        outputs: outputs.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

/// 1x1 convolution with a single output channel.
pub fn conv(name: &str, input: &str, output: &str, w: f32, b: f32) -> LayerNode {
    let mut node = layer(name, "Convolution", &[input], &[output]);
    node.weights = vec![blob(vec![1, 1, 1, 1], vec![w]), blob(vec![1], vec![b])];
    node
}

/// In-place three-tensor batch norm with an exact epsilon of zero.
pub fn batch_norm(name: &str, io: &str, mean: f32, var: f32) -> LayerNode {
    let mut node = layer(name, "BatchNorm", &[io], &[io]);
    node.weights = vec![
        blob(vec![1], vec![mean]),
        blob(vec![1], vec![var]),
        blob(vec![1], vec![1.0]),
    ];
    node.batch_norm = Some(BatchNormParam { eps: Some(0.0) });
    node
}

pub fn graph(layers: Vec<LayerNode>) -> NetworkGraph {
    NetworkGraph {
        name: "Net".to_string(),
        layers,
        ..Default::default()
    }
}

pub fn options() -> CompileOptions {
    CompileOptions {
        net_name: "Net".to_string(),
        ..Default::default()
    }
}

pub fn compiler(options: CompileOptions) -> Compiler {
    Compiler::new().with_options(options).with_default_patterns()
}

pub fn compile(graph: &NetworkGraph, windows: &[WindowSpec]) -> CompilationResult {
    compiler(options()).compile(graph, windows).unwrap()
}

pub fn f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
