mod common;

use common::layer;
use netforge::compiler::patterns::{get_default_patterns, segment, FusedKind};
use netforge::model::LayerNode;

fn nodes(kinds: &[&str], tag: &str) -> Vec<LayerNode> {
    kinds
        .iter()
        .enumerate()
        .map(|(i, k)| {
            let name = format!("{}{}", tag, i);
            layer(&name, k, &["rois"], &[&name])
        })
        .collect()
}

fn roi_groups(times: usize) -> Vec<&'static str> {
    (0..times)
        .flat_map(|_| ["ROIPooling", "ROIPooling", "ROIPooling", "Concat"])
        .collect()
}

fn ps_groups(times: usize) -> Vec<&'static str> {
    (0..times)
        .flat_map(|_| ["PSROIPooling", "Pooling", "Reshape"])
        .collect()
}

/// `lead` ReLUs, the group, then one trailing ReLU.
fn padded(lead: usize, group: &[&str]) -> Vec<LayerNode> {
    let mut layers = nodes(&vec!["ReLU"; lead], "pre");
    layers.extend(nodes(group, "g"));
    layers.extend(nodes(&["ReLU"], "post"));
    layers
}

fn kinds(layers: &[LayerNode]) -> Vec<(usize, FusedKind)> {
    segment(layers, &get_default_patterns())
        .unwrap()
        .iter()
        .map(|s| (s.anchor, s.kind))
        .collect()
}

#[test]
fn test_nine_way_super_pattern_is_3x3() {
    let layers = nodes(&roi_groups(3), "g");
    let segs = segment(&layers, &get_default_patterns()).unwrap();
    assert_eq!(segs.len(), 1);
    assert_eq!(segs[0].kind, FusedKind::RoiPooling3x3Way);
    assert_eq!(segs[0].roles.consumed, 12);
    assert_eq!(segs[0].roles.outputs, vec![3, 7, 11]);
}

#[test]
fn test_3x3_anchor_offset_sweep() {
    for lead in 0..6 {
        let layers = padded(lead, &roi_groups(3));
        let mut expected: Vec<(usize, FusedKind)> = (0..lead).map(|i| (i, FusedKind::Relu)).collect();
        expected.push((lead, FusedKind::RoiPooling3x3Way));
        expected.push((lead + 12, FusedKind::Relu));
        assert_eq!(kinds(&layers), expected, "lead {}", lead);
    }
}

#[test]
fn test_multi_output_variant_wins() {
    let mut group = roi_groups(3);
    group.extend(["ProposalSlice"; 3]);
    for lead in 0..4 {
        let segs = segment(&padded(lead, &group), &get_default_patterns()).unwrap();
        let roi = &segs[lead];
        assert_eq!(roi.kind, FusedKind::RoiPooling3x3WayMultiOut);
        assert_eq!(roi.roles.consumed, 15);
        assert_eq!(roi.roles.outputs, vec![lead + 12, lead + 13, lead + 14]);
    }
}

#[test]
fn test_two_groups_fall_back_to_3_way() {
    for lead in 0..4 {
        let layers = padded(lead, &roi_groups(2));
        let found: Vec<FusedKind> = kinds(&layers)[lead..lead + 2].iter().map(|s| s.1).collect();
        assert_eq!(found, vec![FusedKind::RoiPooling3Way; 2], "lead {}", lead);
    }
}

#[test]
fn test_ps_roi_sweep() {
    let mut six = ps_groups(6);
    six.extend(["Eltwise", "Eltwise"]);
    for lead in 0..6 {
        let got = kinds(&padded(lead, &six));
        assert_eq!(got[lead], (lead, FusedKind::PsRoiPooling3Way), "lead {}", lead);
        assert_eq!(got[lead + 1], (lead + 20, FusedKind::Relu));

        let got = kinds(&padded(lead, &ps_groups(2)));
        assert_eq!(got[lead], (lead, FusedKind::PsRoiPooling), "lead {}", lead);
        assert_eq!(got[lead + 1], (lead + 6, FusedKind::Relu));
    }
}

#[test]
fn test_claimed_positions_never_start_a_match() {
    // A lone ROIPooling right after a 3-way group starts its own segment, never one that
    // borrows members of the group.
    let mut group = roi_groups(1);
    group.extend(["ROIPooling", "ROIPooling", "ROIPooling"]);
    let got = kinds(&nodes(&group, "g"));
    assert_eq!(
        got,
        vec![
            (0, FusedKind::RoiPooling3Way),
            (4, FusedKind::RoiPooling),
            (5, FusedKind::RoiPooling),
            (6, FusedKind::RoiPooling),
        ]
    );
}

fn grid_kinds() -> Vec<&'static str> {
    let mut kinds = vec!["Slice"; 5];
    kinds.extend(["Convolution"; 16]);
    kinds.extend(["Concat"; 5]);
    kinds
}

#[test]
fn test_grid_conv_sweep() {
    for lead in 0..6 {
        let segs = segment(&padded(lead, &grid_kinds()), &get_default_patterns()).unwrap();
        let grid = &segs[lead];
        assert_eq!(grid.kind, FusedKind::GridConv, "lead {}", lead);
        assert_eq!(grid.roles.consumed, 26);
        assert_eq!(grid.roles.outputs, vec![lead + 25]);
        assert_eq!((segs[lead + 1].anchor, segs[lead + 1].kind), (lead + 26, FusedKind::Relu));
    }
}

#[test]
fn test_grid_cell_with_batch_norm_breaks_the_block() {
    let mut group = grid_kinds();
    group[8] = "BatchNorm";
    let got = kinds(&nodes(&group, "g"));
    assert_eq!(got[0], (0, FusedKind::Slice));
    assert!(got.iter().all(|s| s.1 != FusedKind::GridConv));
}
