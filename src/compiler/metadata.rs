//! Per-class tables, capability flags and anchor geometry baked into the constructor.
use super::emit::{Arg, ListKind, Platform, Stmt, Target, Variant};
use crate::config::CompileOptions;
use crate::model::{LayerKind, LayerNode, NetworkGraph, RpnOption};
use tracing::warn;

/// Classes a 3D vehicle attribute head reports on.
pub const ATTRIBUTE_CLASSES: [&str; 8] = [
    "car",
    "van",
    "truck",
    "excavator",
    "forklift",
    "crane",
    "vehicle",
    "bus",
];

/// Road users with direction, occlusion and truncation attributes, also used for masks.
pub const EXTENDED_CLASSES: [&str; 12] = [
    "pedestrian",
    "rider",
    "bicycle",
    "motorbike",
    "car",
    "van",
    "truck",
    "excavator",
    "forklift",
    "crane",
    "vehicle",
    "bus",
];

pub const FALSE_POSITIVE_CLASSES: [&str; 1] = ["pedestrian"];

const CLASS_TYPES: [(&str, &str); 22] = [
    ("pedestrian", "OD_PEDESTRIAN"),
    ("rider", "OD_RIDER"),
    ("bicycle", "OD_BICYCLE"),
    ("motorbike", "OD_MOTORBIKE"),
    ("car", "OD_CAR"),
    ("sedan", "OD_SEDAN"),
    ("van", "OD_VAN"),
    ("truck", "OD_TRUCK"),
    ("bus", "OD_BUS"),
    ("ts", "OD_TRAFFIC_SIGN"),
    ("ts_c", "OD_TRAFFIC_SIGN_CIRCLE"),
    ("ts_t", "OD_TRAFFIC_SIGN_TRIANGLE"),
    ("ts_r", "OD_TRAFFIC_SIGN_RECTANGLE"),
    ("ts_s", "OD_TRAFFIC_SIGN_RECTANGLE"),
    ("tl", "OD_TRAFFIC_LIGHT"),
    ("tl_c", "OD_TRAFFIC_LIGHT_CAR"),
    ("tl_p", "OD_TRAFFIC_LIGHT_PED"),
    ("ts_sup", "OD_TRAFFIC_SIGN_SUP"),
    ("ts_supl", "OD_TRAFFIC_SIGN_SUP_LETTER"),
    ("ts_supd", "OD_TRAFFIC_SIGN_SUP_DRAWING"),
    ("ts_supa", "OD_TRAFFIC_SIGN_SUP_ARROW"),
    ("ts_supz", "OD_TRAFFIC_SIGN_SUP_ZONE"),
];

/// Fully qualified runtime class type of a class name.
pub fn class_type(name: &str) -> Option<String> {
    CLASS_TYPES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, t)| format!("IObjectDetector::ClassType::{}", t))
}

/// Class name prefix of a traffic-sign region.
pub fn region_prefix(region: &str) -> &'static str {
    match region.to_lowercase().as_str() {
        "korea" | "kor" => "k_",
        "germany" | "ger" => "g_",
        "japan" | "jp" => "j_",
        _ => "",
    }
}

/// Nested numeric list text, one inner list per `]`: `"[[0.5, 1, 2]]"` gives `[[0.5, 1, 2]]`.
/// Tokens that are not numbers are dropped.
pub fn parse_param_int(text: &str) -> Vec<Vec<f32>> {
    text.split(']')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            part.split(',')
                .map(|t| t.trim().replace(['[', ']'], ""))
                .filter(|t| !t.is_empty())
                .filter_map(|t| t.parse::<f32>().ok())
                .collect()
        })
        .collect()
}

/// Flat list text: `"[car, van]"` gives `["car", "van"]`.
pub fn parse_param_str(text: &str) -> Vec<String> {
    text.split(',')
        .map(|t| t.trim().replace(['[', ']'], ""))
        .filter(|t| !t.is_empty())
        .collect()
}

/// True for each class that contains, or is contained in, a vocabulary entry.
pub fn capability_flags(class_names: &[String], vocabulary: &[&str]) -> Vec<bool> {
    class_names
        .iter()
        .map(|c| {
            vocabulary
                .iter()
                .any(|v| c.contains(v) || v.contains(c.as_str()))
        })
        .collect()
}

/// Vocabulary of an attribute head: small heads only cover vehicles.
pub fn attribute_vocabulary(node: &LayerNode) -> &'static [&'static str] {
    match node.inputs.len() {
        4 | 5 => &ATTRIBUTE_CLASSES,
        _ => &EXTENDED_CLASSES,
    }
}

/// Network class index of every detector output. Defaults to the identity over the classes plus
/// background.
pub fn class_map(graph: &NetworkGraph, node: &LayerNode) -> Vec<i64> {
    let text = node
        .detection
        .as_ref()
        .map(|d| d.class_map.as_str())
        .unwrap_or_default();
    let parsed: Vec<i64> = parse_param_str(text)
        .iter()
        .filter_map(|t| t.parse::<f32>().ok())
        .map(|v| v as i64)
        .collect();
    if parsed.is_empty() {
        let n = parse_param_str(&graph.class_names).len() as i64;
        (0..=n).collect()
    } else {
        parsed
    }
}

/// `const <ty> _<name>[] = {...}; <name>.assign(_<name>, _<name> + n);`
fn assigned_table(ty: &str, name: &str, items: Vec<Arg>) -> Vec<Stmt> {
    let n = items.len();
    let local = format!("_{}", name);
    vec![
        Stmt::declare(
            &format!("const {}", ty),
            &format!("{}[]", local),
            Arg::List(ListKind::Braced, items),
        ),
        Stmt::on(
            Target::Object(name.to_string()),
            "assign",
            vec![Arg::symbol(&local), Arg::symbol(format!("{} + {}", local, n))],
        ),
    ]
}

pub fn class_map_stmts(map: &[i64]) -> Vec<Stmt> {
    assigned_table("int", "class_map", map.iter().map(|&v| Arg::Int(v)).collect())
}

/// Per-class boolean table such as `has_attribute`.
pub fn flag_stmts(ty: &str, name: &str, flags: &[bool]) -> Vec<Stmt> {
    assigned_table(ty, name, flags.iter().map(|&f| Arg::Bool(f)).collect())
}

/// Anchor tensors for a multi-level RPN, stored in the constructor member `object`. Levels
/// without ratios or scales get an empty `1x4` anchor set.
pub fn anchor_stmts(layer: &str, object: &str, rpn: &[RpnOption]) -> Vec<Stmt> {
    let mut out = vec![
        Stmt::Comment(layer.to_string()),
        Stmt::on(
            Target::Object(object.to_string()),
            "resize",
            vec![Arg::Int(rpn.len() as i64), Arg::symbol("{}")],
        ),
    ];
    for (i, option) in rpn.iter().enumerate() {
        let anchor = format!("{}[{}]", object, i);
        let ratios = parse_param_int(&option.ratios);
        let scales = parse_param_int(&option.scales);
        match (ratios.first(), scales.first()) {
            (Some(r), Some(s)) if !r.is_empty() && !s.is_empty() => {
                out.push(Stmt::free(
                    "MakeAnchors",
                    vec![
                        Arg::Int(option.base_size as i64),
                        Arg::floats(r.iter().copied()),
                        Arg::floats(s.iter().copied()),
                        Arg::symbol(&anchor),
                    ],
                ));
                out.push(Stmt::Branch {
                    variant: Variant::Platform(Platform::Gpu),
                    enabled: vec![Stmt::free("CopyCPUToGPU", vec![Arg::symbol(&anchor)])],
                    disabled: Vec::new(),
                });
            }
            _ => {
                out.push(Stmt::Assign {
                    target: format!("{}.d1", anchor),
                    value: Arg::Int(1),
                });
                out.push(Stmt::Assign {
                    target: format!("{}.d2", anchor),
                    value: Arg::Int(4),
                });
            }
        }
    }
    out
}

/// `(DETECTION_THRES1, DETECTION_THRES2)` per class; the first is capped at 0.5.
pub fn thresholds(graph: &NetworkGraph) -> Option<(Vec<f32>, Vec<f32>)> {
    let second: Vec<f32> = parse_param_str(&graph.class_thresholds)
        .iter()
        .filter_map(|t| t.parse::<f32>().ok())
        .collect();
    if second.is_empty() {
        return None;
    }
    let first = second.iter().map(|&t| t.min(0.5)).collect();
    Some((first, second))
}

/// Class names, runtime types and default thresholds behind the generated class functions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassTable {
    pub names: Vec<String>,
    /// Fully qualified runtime types; `None` when `ClassType` is left out.
    pub types: Option<Vec<String>>,
    pub thresholds: Option<(Vec<f32>, Vec<f32>)>,
}

impl ClassTable {
    /// `region` is set only for region-specific recognizers, whose names carry the region prefix
    /// and which have no class types.
    pub fn new(graph: &NetworkGraph, region: Option<&str>) -> Self {
        let raw = parse_param_str(&graph.class_names);
        let thresholds = thresholds(graph);
        if let Some(region) = region {
            let prefix = region_prefix(region);
            return Self {
                names: raw.iter().map(|n| format!("{}{}", prefix, n)).collect(),
                types: None,
                thresholds,
            };
        }
        let types: Option<Vec<String>> = raw.iter().map(|n| class_type(n)).collect();
        if types.is_none() && !raw.is_empty() {
            let unknown: Vec<&str> = raw
                .iter()
                .filter(|n| class_type(n).is_none())
                .map(String::as_str)
                .collect();
            warn!("No runtime class type for {:?}; ClassType is omitted", unknown);
        }
        Self {
            names: raw,
            types,
            thresholds,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

fn reshape_channels(node: &LayerNode) -> Option<i64> {
    node.reshape.as_ref().and_then(|r| r.dims.get(1).copied())
}

/// Sibling layer `<prefix><tag><suffix>`, falling back to `<prefix><tag>`.
fn sibling<'a>(graph: &'a NetworkGraph, prefix: &str, tag: &str, suffix: &str) -> Option<&'a LayerNode> {
    graph
        .layer(&format!("{}{}{}", prefix, tag, suffix))
        .or_else(|| graph.layer(&format!("{}{}", prefix, tag)))
}

/// Whether the layer is a two-channel score head whose weights load with `FOLD`.
pub fn is_fold(graph: &NetworkGraph, options: &CompileOptions, node: &LayerNode) -> bool {
    let kind = node.op();
    options.fold_prefixes(&node.name).any(|prefix| {
        let suffix = &node.name[prefix.len()..];
        if matches!(kind, LayerKind::Convolution | LayerKind::InnerProduct) && node.num_output() == 2 {
            return true;
        }
        if sibling(graph, prefix, "_reshape", suffix).and_then(reshape_channels) == Some(2) {
            return true;
        }
        sibling(graph, prefix, "_d2s", suffix)
            .filter(|d2s| d2s.op() == LayerKind::Depth2Space)
            .is_some_and(|d2s| {
                let s = d2s.resample_scale();
                s > 0 && node.num_output() / (s * s) == 2
            })
    })
}
