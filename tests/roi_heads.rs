mod common;

use common::*;
use netforge::compiler::{FunctionRole, WindowSpec};
use netforge::model::{LayerNode, NetworkGraph, RoiPoolingParam};

const SCALES: [f32; 3] = [0.25, 0.125, 0.0625];

/// Three groups of three pyramid-level ROI poolings, each closed by a concat.
fn nine_way_head() -> NetworkGraph {
    let mut layers: Vec<LayerNode> = Vec::new();
    for g in 0..3 {
        let mut members = Vec::new();
        for (k, scale) in SCALES.iter().enumerate() {
            let name = format!("r{}{}", g, k);
            let mut node = layer(&name, "ROIPooling", &[&format!("f{}", k), "rois"], &[&name]);
            node.roi_pooling = Some(RoiPoolingParam {
                pooled_h: 7,
                pooled_w: 7,
                spatial_scale: Some(*scale),
                ..Default::default()
            });
            layers.push(node);
            members.push(name);
        }
        let inputs: Vec<&str> = members.iter().map(String::as_str).collect();
        let concat = format!("c{}", g);
        layers.push(layer(&concat, "Concat", &inputs, &[&concat]));
    }
    graph(layers)
}

#[test]
fn test_detection_head_reads_feature_maps() {
    let result = compile(
        &nine_way_head(),
        &[WindowSpec::new("Detect", "r00", "c2").with_role(FunctionRole::Detection)],
    );
    assert!(result.code.contains(
        "  cnn->roi_pooling_3x3way(*feat_maps.at(\"f0\"), *feat_maps.at(\"f1\"), *feat_maps.at(\"f2\"), rois, \
         7, 7, 7, 7, 7, 7, 0.25, 0.125, 0.0625, data_blobs[7], data_blobs[11], data_blobs[15], FC2CONV, MAX_POOL);\n"
    ));
    let detect = result.function("Detect").unwrap();
    assert_eq!(detect.checkpoints(), vec!["Net::Detect::r00"]);
    assert!(result.diagnostics.is_empty());
}

#[test]
fn test_general_head_reads_local_blobs() {
    let result = compile(&nine_way_head(), &[WindowSpec::new("Pool", "r00", "c2")]);
    assert!(result.code.contains(
        "  cnn->roi_pooling_3x3way(data_blobs[0], data_blobs[3], data_blobs[5], rois, \
         7, 7, 7, 7, 7, 7, 0.25, 0.125, 0.0625, data_blobs[7], data_blobs[11], data_blobs[15], MAX_POOL);\n"
    ));
}

#[test]
fn test_window_inside_claimed_group_emits_nothing() {
    // The group is claimed from r00, so a window starting at r01 only registers its blobs.
    let result = compile(&nine_way_head(), &[WindowSpec::new("Late", "r01", "c2")]);
    assert!(result.function("Late").unwrap().is_empty());
    assert!(!result.code.contains("void Net::Late"));
    assert_eq!(result.tables.lookup_blob("c2"), Some(15));
}

/// Two (PSROIPooling, Pooling, Reshape) groups followed by a ReLU.
fn ps_head() -> NetworkGraph {
    let mut layers = Vec::new();
    for g in 0..2 {
        let (f, p, q, s) = (
            format!("f{}", g),
            format!("p{}", g),
            format!("q{}", g),
            format!("s{}", g),
        );
        let mut roi = layer(&p, "PSROIPooling", &[&f, "rois"], &[&p]);
        roi.roi_pooling = Some(RoiPoolingParam {
            pooled_h: 7,
            pooled_w: 7,
            spatial_scale: Some(0.0625),
            ..Default::default()
        });
        layers.push(roi);
        layers.push(layer(&q, "Pooling", &[&p], &[&q]));
        layers.push(layer(&s, "Reshape", &[&q], &[&s]));
    }
    layers.push(layer("r", "ReLU", &["s1"], &["r"]));
    graph(layers)
}

#[test]
fn test_ps_group_reshapes_keep_own_slots() {
    let result = compile(&ps_head(), &[WindowSpec::new("Ps", "p0", "r")]);
    let tables = &result.tables;
    assert_eq!(tables.lookup_blob("q0"), Some(3));
    assert_eq!(tables.lookup_blob("s0"), Some(4));
    assert_eq!(tables.lookup_blob("s1"), Some(8));
    assert_eq!(tables.lookup_blob("r"), Some(9));
    assert!(result
        .code
        .contains("  cnn->ps_roi_pooling(data_blobs[0], rois, 7, 7, 0.0625, data_blobs[4]);\n"));
    assert!(result
        .code
        .contains("  cnn->ps_roi_pooling(data_blobs[5], rois, 7, 7, 0.0625, data_blobs[8]);\n"));
}

#[test]
fn test_standalone_reshape_still_aliases() {
    let layers = vec![
        layer("act", "ReLU", &["data"], &["act"]),
        layer("flat", "Reshape", &["act"], &["flat"]),
    ];
    let result = compile(&graph(layers), &[WindowSpec::new("Flat", "act", "flat")]);
    assert_eq!(result.tables.lookup_blob("flat"), Some(1));
}
