mod common;

use approx::assert_abs_diff_eq;
use common::*;
use netforge::compiler::index::IndexTables;
use netforge::compiler::patterns::{FusedKind, Roles};
use netforge::compiler::{CompileError, Compiler, Diagnostic, FunctionRole, WindowSpec};
use netforge::config::CompileOptions;
use netforge::model::{ConvolutionParam, LayerNode, QuantizationParam, QuantizeInfo};

fn conv_bn_relu() -> netforge::model::NetworkGraph {
    graph(vec![
        conv("c1", "data", "c1", 1.0, 0.0),
        batch_norm("bn1", "c1", 3.0, 4.0),
        layer("relu1", "ReLU", &["c1"], &["c1"]),
    ])
}

fn three_convs() -> netforge::model::NetworkGraph {
    graph(vec![
        conv("c1", "data", "c1", 1.0, 0.1),
        conv("c2", "c1", "c2", 2.0, 0.2),
        conv("c3", "c2", "c3", 3.0, 0.3),
    ])
}

#[test]
fn test_conv_bn_relu_end_to_end() {
    let result = compile(&conv_bn_relu(), &[WindowSpec::new("Run", "c1", "relu1")]);
    let run = result.function("Run").unwrap();
    assert_eq!(run.checkpoints(), vec!["Net::Run::c1"]);
    assert_eq!(run.terminal_tag(), Some("Net::Run::c1"));

    let code = &result.code;
    assert!(code.contains(
        "  cnn->conv_bias_relu(data_blobs[0], layer_blobs[0][0], layer_blobs[0][1], 1, 1, 0, 0, 1, 1, data_blobs[1]);\n"
    ));
    assert!(code.contains("  EVT_END(\"Net::Run::c1\");\n"));
    assert!(code.contains("void Net::Run() {\n  EVT_START;\n"));
    assert!(code.contains("  data_blobs.resize(2, {});\n"));
    assert!(code.contains("  layer_blobs[0].resize(2, {});\n"));
    assert!(code.contains("  layer_blobs[0][0].ReshapeCPU(1, 1, 1, 1);\n"));
    assert!(code.contains("  layer_blobs[0][0].LoadCPU(Net_wt, 0);\n"));
    assert!(code.contains("  layer_blobs[0][1].LoadCPU(Net_wt, 4);\n"));
    assert!(code.contains("  NOT_IMPLEMENT_ERROR;\n"));
    assert!(code.contains("REGISTER_NET(Net_CPU);"));

    let chunks = result.weights.chunks();
    assert_eq!(chunks.len(), 1);
    let values = f32s(&chunks[0].data);
    assert_eq!(values.len(), 2);
    assert_abs_diff_eq!(values[0], 0.5, epsilon = 1e-6);
    assert_abs_diff_eq!(values[1], -1.5, epsilon = 1e-6);
    assert!(result.diagnostics.is_empty());
}

#[test]
fn test_compilation_is_deterministic() {
    let g = three_convs();
    let windows = [WindowSpec::new("Run", "c1", "c3")];
    let a = compile(&g, &windows);
    let b = compile(&g, &windows);
    assert_eq!(a.code, b.code);
    assert_eq!(a.weights, b.weights);
    assert_eq!(a.tables, b.tables);
}

#[test]
fn test_skip_mode_keeps_offsets() {
    let g = three_convs();
    let windows = [WindowSpec::new("Run", "c1", "c3")];
    let full = compile(&g, &windows);
    let skipped = compiler(CompileOptions {
        skip_weights: true,
        ..options()
    })
    .compile(&g, &windows)
    .unwrap();
    assert_eq!(skipped.code, full.code);
    assert_eq!(skipped.weights.total_bytes(), full.weights.total_bytes());
    assert!(skipped.weights.chunks().iter().all(|c| c.data.is_empty()));

    let dir = tempfile::tempdir().unwrap();
    assert!(skipped.write_artifacts(dir.path()).unwrap().is_empty());
}

#[test]
fn test_tensors_never_straddle_chunks() {
    let result = compiler(CompileOptions {
        chunk_size: 10,
        ..options()
    })
    .compile(&three_convs(), &[WindowSpec::new("Run", "c1", "c3")])
    .unwrap();
    let chunks = result.weights.chunks();
    let bases: Vec<u64> = chunks.iter().map(|c| c.base).collect();
    assert_eq!(bases, vec![0, 8, 16]);
    assert!(chunks.iter().all(|c| c.len <= 10));
    assert!(result.code.contains("const unsigned int Net_wt_base[] = { 0, 8, 16 };"));
    assert!(result.code.contains("const unsigned char* Net_wt[] = { Net_wt000, Net_wt001, Net_wt002 };"));
    assert!(result.code.contains("  layer_blobs[2][1].LoadCPU(Net_wt, 20);\n"));
}

#[test]
fn test_slots_stable_across_windows() {
    let g = graph(vec![
        conv("c1", "data", "c1", 1.0, 0.0),
        conv("c2", "c1", "c2", 1.0, 0.0),
        layer("s2", "Sigmoid", &["c2"], &["s2"]),
    ]);
    let result = compile(
        &g,
        &[
            WindowSpec::new("Backbone", "c1", "c1"),
            WindowSpec::new("Head", "c2", "s2"),
        ],
    );
    assert_eq!(result.tables.lookup_blob("c1"), Some(1));
    assert_eq!(result.tables.lookup_blob("c2"), Some(2));
    // In-place sigmoid shares its input's slot.
    assert_eq!(result.tables.lookup_blob("s2"), Some(2));
    assert!(result.code.contains(
        "  cnn->conv(data_blobs[1], layer_blobs[1][0], layer_blobs[1][1], 1, 1, 0, 0, 1, 1, true, data_blobs[2]);\n"
    ));
    assert!(result.code.contains("  cnn->sigmoid(data_blobs[2], data_blobs[2]);\n"));
    assert!(result.code.contains("  data_blobs.resize(3, {});\n"));
    assert_eq!(
        result.function("Head").unwrap().terminal_tag(),
        Some("Net::Head::s2")
    );
}

#[test]
fn test_seeded_tables_are_continued() {
    let mut seed = IndexTables::new();
    seed.blob_slot("image");
    let result = compiler(options())
        .compile_with_tables(&three_convs(), &[WindowSpec::new("Run", "c1", "c1")], seed.clone())
        .unwrap();
    assert_eq!(result.tables.lookup_blob("image"), Some(0));
    assert_eq!(result.tables.lookup_blob("data"), Some(1));
    assert_eq!(seed.lookup_blob("data"), None);
}

#[test]
fn test_split_fan_out_blocks_in_place_alias() {
    let g = graph(vec![
        conv("c1", "data", "c1", 1.0, 0.0),
        layer("split1", "Split", &["c1"], &["c1_split_0", "c1_split_1"]),
        layer("sig1", "Sigmoid", &["c1"], &["sig1"]),
    ]);
    let result = compile(&g, &[WindowSpec::new("Run", "c1", "sig1")]);
    assert_eq!(result.tables.lookup_blob("c1_split_0"), Some(1));
    assert_eq!(result.tables.lookup_blob("c1_split_1"), Some(1));
    assert_eq!(result.tables.lookup_blob("sig1"), Some(2));
    assert!(result.code.contains("  cnn->sigmoid(data_blobs[1], data_blobs[2]);\n"));
    // The split itself lowers to nothing.
    assert_eq!(
        result.function("Run").unwrap().checkpoints(),
        vec!["Net::Run::c1", "Net::Run::sig1"]
    );
}

#[test]
fn test_unknown_layer_is_reported_and_skipped() {
    let g = graph(vec![
        conv("c1", "data", "c1", 1.0, 0.0),
        layer("sw1", "Swish", &["c1"], &["sw1"]),
        conv("c2", "sw1", "c2", 1.0, 0.0),
    ]);
    let result = compile(&g, &[WindowSpec::new("Run", "c1", "c2")]);
    assert_eq!(
        result.diagnostics,
        vec![Diagnostic {
            function: "Run".to_string(),
            layer: "sw1".to_string(),
            kind: "Swish".to_string(),
        }]
    );
    assert_eq!(result.tables.lookup_blob("sw1"), Some(2));
    assert_eq!(
        result.function("Run").unwrap().checkpoints(),
        vec!["Net::Run::c1", "Net::Run::c2"]
    );
}

#[test]
fn test_custom_pattern_extends_coverage() {
    let g = graph(vec![
        conv("c1", "data", "c1", 1.0, 0.0),
        layer("sw1", "Swish", &["c1"], &["sw1"]),
    ]);
    let result = Compiler::new()
        .with_name("Net")
        .with_pattern("Swish", FusedKind::Sigmoid, |layers: &[LayerNode], a: usize| {
            (layers[a].kind == "Swish").then(|| Roles {
                consumed: 1,
                ..Default::default()
            })
        })
        .with_default_patterns()
        .compile(&g, &[WindowSpec::new("Run", "c1", "sw1")])
        .unwrap();
    assert!(result.diagnostics.is_empty());
    assert!(result.code.contains("  cnn->sigmoid(data_blobs[1], data_blobs[2]);\n"));
}

#[test]
fn test_missing_anchor_is_fatal() {
    let err = compiler(options())
        .compile(&three_convs(), &[WindowSpec::new("Run", "nope", "c3")])
        .err()
        .unwrap();
    match err {
        CompileError::MissingAnchor { function, names } => {
            assert_eq!(function, "Run");
            assert_eq!(names, vec!["nope".to_string()]);
        }
        other => panic!("unexpected error: {}", other),
    }

    // The exit must come after the entry.
    let err = compiler(options())
        .compile(&three_convs(), &[WindowSpec::new("Run", "c2", "c1")])
        .err()
        .unwrap();
    assert!(matches!(err, CompileError::MissingAnchor { .. }));
}

#[test]
fn test_weightless_conv_is_invalid() {
    let g = graph(vec![layer("c1", "Convolution", &["data"], &["c1"])]);
    let err = compiler(options())
        .compile(&g, &[WindowSpec::new("Run", "c1", "c1")])
        .err()
        .unwrap();
    assert!(matches!(err, CompileError::InvalidModel { layer, .. } if layer == "c1"));
}

#[test]
fn test_speedup_disabled_layer_is_guarded() {
    let result = compiler(CompileOptions {
        speedup_disabled_layers: vec!["c2".to_string()],
        ..options()
    })
    .compile(&three_convs(), &[WindowSpec::new("Run", "c1", "c3")])
    .unwrap();
    assert!(result.code.contains(
        "#ifndef SPEEDUP_RPN\n  cnn->conv(data_blobs[1], layer_blobs[1][0], layer_blobs[1][1], 1, 1, 0, 0, 1, 1, true, data_blobs[2]);\n#endif\n"
    ));
    // Its weights still load and its checkpoint stays unconditional.
    assert!(result.code.contains("  layer_blobs[1][0].LoadCPU(Net_wt, 8);\n"));
    assert!(result.code.contains("  EVT_CHECK(\"Net::Run::c2\");\n"));
}

#[test]
fn test_skipped_sigmoid_is_silent() {
    let g = graph(vec![
        conv("c1", "data", "c1", 1.0, 0.0),
        layer("s1", "Sigmoid", &["c1"], &["s1"]),
    ]);
    let result = compiler(CompileOptions {
        skip_layers: vec!["s1".to_string()],
        ..options()
    })
    .compile(&g, &[WindowSpec::new("Run", "c1", "s1")])
    .unwrap();
    assert!(!result.code.contains("sigmoid"));
    assert!(result.diagnostics.is_empty());
    assert_eq!(result.function("Run").unwrap().terminal_tag(), Some("Net::Run::c1"));
}

#[test]
fn test_int8_companion_loads() {
    let mut q = conv("c1", "data", "c1", 1.0, 0.5);
    q.kind = "ConvolutionRistretto".to_string();
    q.quantization = Some(QuantizationParam {
        fl_params: 5,
        bw_params: 8,
        fl_params_bias: Some(1000),
        bw_params_bias: Some(0),
    });
    let result = compiler(options())
        .with_int8_model(graph(vec![q]))
        .compile(
            &graph(vec![conv("c1", "data", "c1", 1.0, 0.5)]),
            &[WindowSpec::new("Run", "c1", "c1")],
        )
        .unwrap();
    let code = &result.code;
    assert!(code.contains("  LOAD_INT_W(0, 0, 5, 8);\n"));
    assert!(code.contains("  LOAD_INT_B(0, 4, 5, 8);\n"));
    assert!(code.contains("extern unsigned char Net_int8_wt000[];"));
    assert!(code.contains("#define LOAD_INT_W(idx, offset, shift_bit, max_bit) layer_blobs[idx][0].LoadInt("));
    assert!(code.contains("REGISTER_NET(Net_INT);"));
    assert!(!code.contains("NOT_IMPLEMENT_ERROR"));
    assert_eq!(result.int8_weights.as_ref().map(|w| w.total_bytes()), Some(8));
}

#[test]
fn test_int8_without_bias_sets_shift() {
    let no_bias = |kind: &str| {
        let mut node = conv("c1", "data", "c1", 1.0, 0.0);
        node.kind = kind.to_string();
        node.weights.truncate(1);
        node.convolution = Some(ConvolutionParam {
            bias_term: Some(false),
            ..Default::default()
        });
        node
    };
    let mut q = no_bias("ConvolutionRistretto");
    q.quantization = Some(QuantizationParam {
        fl_params: 6,
        bw_params: 8,
        ..Default::default()
    });
    let result = compiler(options())
        .with_int8_model(graph(vec![q]))
        .compile(
            &graph(vec![no_bias("Convolution")]),
            &[WindowSpec::new("Run", "c1", "c1")],
        )
        .unwrap();
    assert!(result.code.contains("  LOAD_INT_W(0, 0, 6, 8);\n"));
    assert!(result.code.contains("  SET_SHIFTN_B(0, 6);\n"));
    assert!(!result.code.contains("LOAD_INT_B(0"));
}

#[test]
fn test_activation_shifts() {
    let info = QuantizeInfo::from_json(r#"{"data": 7, "c1": "INVALID_SHIFT"}"#).unwrap();
    let result = compiler(options())
        .with_quantize_info(info)
        .compile(&three_convs(), &[WindowSpec::new("Run", "c1", "c1")])
        .unwrap();
    assert!(result.code.contains("  SET_SHIFTN_D(0, 7);\n  // data\n"));
    assert!(!result.code.contains("SET_SHIFTN_D(1,"));
}

#[test]
fn test_false_positive_role() {
    let mut g = graph(vec![
        conv("c1", "data", "c1", 1.0, 0.0),
        layer("s1", "Sigmoid", &["c1"], &["s1"]),
    ]);
    g.class_names = "[pedestrian, car, ts]".to_string();
    let result = compile(
        &g,
        &[WindowSpec::new("Fp", "c1", "s1").with_role(FunctionRole::FalsePositive)],
    );
    let code = &result.code;
    assert!(code.contains("  const bool_t _checks_fp[] = {true, false, false};\n"));
    assert!(code.contains("  checks_fp.assign(_checks_fp, _checks_fp + 3);\n"));
    assert!(code.contains(
        "  cnn->get_false_positive_output(data_blobs[1], false_positives, options.FPR_THRES);\n"
    ));
    assert!(code.contains("  return 3;\n"));
    assert_eq!(
        result.function("Fp").unwrap().checkpoints(),
        vec!["Net::Fp::c1", "Net::Fp::s1", "Net::Fp::fp_recognition"]
    );
    assert_eq!(
        result.function("Fp").unwrap().terminal_tag(),
        Some("Net::Fp::fp_recognition")
    );
}

#[test]
fn test_mask_role() {
    let mut g = graph(vec![conv("c1", "data", "c1", 1.0, 0.0)]);
    g.class_names = "[pedestrian, car, ts]".to_string();
    let result = compile(
        &g,
        &[WindowSpec::new("Mask", "c1", "c1")
            .with_role(FunctionRole::MaskDetection)
            .with_signature("std::vector<Tensor*>& masks")],
    );
    let code = &result.code;
    assert!(code.contains("void Net::Mask(std::vector<Tensor*>& masks) {"));
    assert!(code.contains("  const bool_t _has_mask[] = {true, true, false};\n"));
    assert!(code.contains("  cnn->sigmoid(data_blobs[1], data_blobs[1]);\n"));
    assert!(code.contains("  this->get_output(data_blobs[1], masks);\n"));
    assert!(code.contains("  EVT_END(\"Net::Mask::mask_detection\");\n"));
}

#[test]
fn test_segmentation_rebinds_its_input() {
    let g = graph(vec![
        conv("c1", "data", "c1", 1.0, 0.0),
        layer("seg", "Segmentation", &["c1"], &["seg_out"]),
    ]);
    let result = compile(&g, &[WindowSpec::new("Seg", "c1", "seg")]);
    assert!(result.code.contains(
        "  cnn->conv(data_blobs[0], layer_blobs[0][0], layer_blobs[0][1], 1, 1, 0, 0, 1, 1, true, seg_map);\n"
    ));
    assert_eq!(result.function("Seg").unwrap().terminal_tag(), Some("Net::Seg::c1"));
}

#[test]
fn test_artifacts_written_to_dir() {
    let result = compile(&conv_bn_relu(), &[WindowSpec::new("Run", "c1", "relu1")]);
    let dir = tempfile::tempdir().unwrap();
    let paths = result.write_artifacts(dir.path()).unwrap();
    assert_eq!(paths.len(), 1);
    assert_eq!(paths[0].file_name().unwrap(), "net_wt000.bin");
    let values = f32s(&std::fs::read(&paths[0]).unwrap());
    assert_abs_diff_eq!(values[0], 0.5, epsilon = 1e-6);
    assert_abs_diff_eq!(values[1], -1.5, epsilon = 1e-6);
}

/// Five slices of `data`, a 4x4 grid of 1x1 convs, four row concats and a final concat.
fn grid_block() -> netforge::model::NetworkGraph {
    let mut layers = Vec::new();
    for i in 0..5 {
        let name = format!("slice{}", i);
        layers.push(layer(&name, "Slice", &["data"], &[&format!("s{}", i)]));
    }
    for cell in 0..16 {
        let name = format!("g{}", cell);
        let input = format!("s{}", cell % 5);
        layers.push(conv(&name, &input, &name, cell as f32, 0.0));
    }
    for row in 0..4 {
        let cells: Vec<String> = (0..4).map(|col| format!("g{}", row * 4 + col)).collect();
        let inputs: Vec<&str> = cells.iter().map(String::as_str).collect();
        let name = format!("row{}", row);
        layers.push(layer(&name, "Concat", &inputs, &[&name]));
    }
    layers.push(layer("out", "Concat", &["row0", "row1", "row2", "row3"], &["out"]));
    graph(layers)
}

#[test]
fn test_grid_conv_block() {
    let result = compile(&grid_block(), &[WindowSpec::new("Grid", "slice0", "out")]);
    let grid = result.function("Grid").unwrap();
    assert_eq!(grid.checkpoints(), vec!["Net::Grid::slice0"]);

    let column_major: Vec<usize> = (0..4).flat_map(|col| (0..4).map(move |row| row * 4 + col)).collect();
    let list = |j: usize| {
        column_major
            .iter()
            .map(|slot| format!("&layer_blobs[{}][{}]", slot, j))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let code = &result.code;
    assert!(code.contains("#if defined(SPEEDUP_GRIDCONV) && defined(USE_CUDNN)\n  if (UseGPU()) {\n"));
    assert!(code.contains(&format!(
        "    const std::vector<const Tensor*> weights = std::vector<const Tensor*> {{{}}};\n",
        list(0)
    )));
    assert!(code.contains(&format!(
        "    const std::vector<const Tensor*> biases = std::vector<const Tensor*> {{{}}};\n",
        list(1)
    )));
    assert!(code.contains(
        "    cnn->grid_conv(data_blobs[0], weights, biases, 4, 4, 1, 0, 1, 1, 1, data_blobs[26]);\n  } else {\n#endif\n"
    ));
    // The unfused lowering stays as the fallback.
    assert!(code.contains(
        "  cnn->conv(data_blobs[1], layer_blobs[0][0], layer_blobs[0][1], 1, 1, 0, 0, 1, 1, true, data_blobs[6]);\n"
    ));
    assert!(code.contains("  // g15\n"));

    // Every cell loads once, in graph order.
    assert_eq!(result.weights.total_bytes(), 16 * 2 * 4);
    assert_eq!(result.tables.lookup_layer("g0"), Some(0));
    assert_eq!(result.tables.lookup_layer("g15"), Some(15));
}

#[test]
fn test_grouped_deconv_folds_per_output_channel() {
    // Kernel `[in, out / group, 1, 1]` with four inputs, two groups and six outputs.
    let mut up = layer("up", "Deconvolution", &["data"], &["up"]);
    up.convolution = Some(ConvolutionParam {
        num_output: 6,
        group: Some(2),
        kernel_size: vec![1],
        stride: vec![1],
        ..Default::default()
    });
    let w: Vec<f32> = (1..=12).map(|v| v as f32).collect();
    up.weights = vec![blob(vec![4, 3, 1, 1], w.clone()), blob(vec![6], vec![0.0; 6])];
    let mut bn = layer("bn", "BatchNorm", &["up"], &["up"]);
    let channels: Vec<f32> = (0..6).map(|c| c as f32).collect();
    bn.weights = vec![
        blob(vec![6], channels.clone()),
        blob(vec![6], channels.iter().map(|c| (c + 1.0) * (c + 1.0)).collect()),
        blob(vec![1], vec![1.0]),
    ];
    bn.batch_norm = Some(netforge::model::BatchNormParam { eps: Some(0.0) });

    let result = compile(&graph(vec![up, bn]), &[WindowSpec::new("Up", "up", "bn")]);
    let values = f32s(&result.weights.chunks()[0].data);
    assert_eq!(values.len(), 18);
    // Input row `i` belongs to group `i / 2`, whose outputs start at `3 * (i / 2)`.
    for i in 0..4 {
        for oc in 0..3 {
            let std = ((i / 2) * 3 + oc + 1) as f32;
            assert_abs_diff_eq!(values[i * 3 + oc], w[i * 3 + oc] / std, epsilon = 1e-6);
        }
    }
    for c in 0..6 {
        assert_abs_diff_eq!(values[12 + c], -(c as f32) / (c as f32 + 1.0), epsilon = 1e-6);
    }
    assert!(result.code.contains("  layer_blobs[0][0].ReshapeCPU(4, 3, 1, 1);\n"));
}

#[test]
fn test_resize_deconv_has_no_weights() {
    let mut up = layer("up", "Deconvolution", &["feat"], &["up"]);
    up.convolution = Some(ConvolutionParam {
        num_output: 8,
        bias_term: Some(false),
        group: Some(8),
        kernel_size: vec![2],
        stride: vec![2],
        weight_filler: "constant".to_string(),
        ..Default::default()
    });
    up.weights = vec![blob(vec![8, 1, 2, 2], vec![0.25; 32])];
    let g = graph(vec![up, conv("c1", "up", "c1", 1.0, 0.0)]);
    let result = compile(&g, &[WindowSpec::new("Up", "up", "c1")]);

    assert!(result.code.contains("  cnn->resize(data_blobs[0], 2, 2, 0, data_blobs[1]);\n"));
    assert_eq!(result.tables.lookup_layer("up"), None);
    assert_eq!(result.tables.lookup_layer("c1"), Some(0));
    // Only the trailing conv's weight and bias are written.
    assert_eq!(result.weights.total_bytes(), 8);
}
