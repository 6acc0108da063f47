//! The compiler driver: windows, the per-compilation session and the public result types.
use crate::config::{CompileOptions, ConfigError};
use crate::model::{LayerNode, ModelError, NetworkGraph, QuantizeInfo};
use emit::{Arg, Constructor, FunctionBody, Stmt, Target, Variant};
use index::IndexTables;
use metadata::ClassTable;
use patterns::{FusedKind, FusedPattern, Pattern, Roles};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use writer::WeightArtifact;

pub mod emit;
pub mod fold;
pub mod generate;
pub mod index;
pub mod metadata;
pub mod ops;
pub mod patterns;
pub mod writer;

#[derive(Error, Debug)]
pub enum CompileError {
    #[error("Invalid model at layer `{layer}`: {reason}")]
    InvalidModel { layer: String, reason: String },
    #[error("Function `{function}`: none of {names:?} is in the graph")]
    MissingAnchor { function: String, names: Vec<String> },
    #[error("Graph position {position} is not claimed by exactly one pattern")]
    AmbiguousMatch { position: usize },
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// What a compiled function is for. Detection-type roles read ROI inputs from the caller's
/// feature maps and carry the `FC2CONV` flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FunctionRole {
    #[default]
    General,
    Detection,
    AttributeDetection,
    MaskDetection,
    FalsePositive,
    Recognition,
}

impl FunctionRole {
    pub fn uses_fc2conv(self) -> bool {
        matches!(
            self,
            Self::Detection | Self::AttributeDetection | Self::MaskDetection | Self::FalsePositive
        )
    }

    pub fn reads_feature_maps(self) -> bool {
        self.uses_fc2conv()
    }
}

/// One compiled function: the graph range from the first `entry` layer to the first `exit`
/// layer after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub function: String,
    pub entry: Vec<String>,
    pub exit: Vec<String>,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub role: FunctionRole,
}

impl WindowSpec {
    pub fn new(function: &str, entry: &str, exit: &str) -> Self {
        Self {
            function: function.to_string(),
            entry: vec![entry.to_string()],
            exit: vec![exit.to_string()],
            signature: String::new(),
            role: FunctionRole::General,
        }
    }

    pub fn with_signature(mut self, signature: &str) -> Self {
        self.signature = signature.to_string();
        self
    }

    pub fn with_role(mut self, role: FunctionRole) -> Self {
        self.role = role;
        self
    }
}

/// A node that was skipped because no emitter covers it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub function: String,
    pub layer: String,
    pub kind: String,
}

pub struct CompilationResult {
    pub code: String,
    pub weights: WeightArtifact,
    pub int8_weights: Option<WeightArtifact>,
    pub functions: Vec<FunctionBody>,
    pub constructor: Constructor,
    pub diagnostics: Vec<Diagnostic>,
    pub tables: IndexTables,
}

impl CompilationResult {
    /// Writes every weight chunk of both streams under `dir`.
    pub fn write_artifacts<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<PathBuf>, CompileError> {
        let mut paths = self.weights.write_to_dir(dir.as_ref())?;
        if let Some(int8) = &self.int8_weights {
            paths.extend(int8.write_to_dir(dir.as_ref())?);
        }
        Ok(paths)
    }

    pub fn function(&self, name: &str) -> Option<&FunctionBody> {
        self.functions.iter().find(|f| f.name == name)
    }
}

pub struct Compiler {
    pub options: CompileOptions,
    pub(crate) patterns: Vec<Pattern>,
    pub(crate) int8_graph: Option<NetworkGraph>,
    pub(crate) quantize_info: Option<QuantizeInfo>,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    pub fn new() -> Self {
        Self {
            options: CompileOptions::default(),
            patterns: Vec::new(),
            int8_graph: None,
            quantize_info: None,
        }
    }

    pub fn with_options(mut self, options: CompileOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.options.net_name = name.to_string();
        self
    }

    /// Registers a pattern. Patterns are tried in registration order, so patterns added before
    /// [`Self::with_default_patterns`] take priority over the built-in ones.
    pub fn with_pattern<M>(mut self, name: &str, kind: FusedKind, matcher: M) -> Self
    where
        M: Fn(&[LayerNode], usize) -> Option<Roles> + Send + Sync + 'static,
    {
        self.patterns.push(Pattern::new(name, kind, matcher));
        self
    }

    pub fn with_default_patterns(mut self) -> Self {
        self.patterns.extend(patterns::get_default_patterns());
        self
    }

    /// Quantized graph of the same topology; enables the int8 companion stream.
    pub fn with_int8_model(mut self, graph: NetworkGraph) -> Self {
        self.int8_graph = Some(graph);
        self
    }

    pub fn with_quantize_info(mut self, info: QuantizeInfo) -> Self {
        self.quantize_info = Some(info);
        self
    }

    pub fn compile(&self, graph: &NetworkGraph, windows: &[WindowSpec]) -> Result<CompilationResult, CompileError> {
        self.compile_with_tables(graph, windows, IndexTables::new())
    }

    /// Like [`Self::compile`], continuing from existing slot tables.
    pub fn compile_with_tables(
        &self,
        graph: &NetworkGraph,
        windows: &[WindowSpec],
        tables: IndexTables,
    ) -> Result<CompilationResult, CompileError> {
        let mut session = CompileSession::new(self, graph, tables)?;
        for window in windows {
            session.compile_window(window)?;
        }
        session.finish()
    }
}

/// Mutable state of one compilation: slot tables, weight streams, the constructor being built
/// and the compiled functions.
pub struct CompileSession<'a> {
    compiler: &'a Compiler,
    graph: &'a NetworkGraph,
    segments: Vec<FusedPattern>,
    owners: Vec<usize>,
    tables: IndexTables,
    weights: WeightArtifact,
    int8_weights: Option<WeightArtifact>,
    /// Bias flag of every layer slot whose weights were already written.
    bias_terms: HashMap<usize, bool>,
    tables_emitted: HashSet<&'static str>,
    recognizes_region: bool,
    constructor: Constructor,
    functions: Vec<FunctionBody>,
    diagnostics: Vec<Diagnostic>,
}

/// Whether `blob` is fanned out through an inserted split, which rules out in-place aliasing.
fn has_split_fan_out(graph: &NetworkGraph, blob: &str) -> bool {
    graph
        .layers
        .iter()
        .flat_map(|l| l.outputs.iter())
        .any(|b| b.contains(blob) && b.contains("split"))
}

fn ints(dims: &[usize]) -> Vec<Arg> {
    dims.iter().map(|&d| Arg::Int(d as i64)).collect()
}

impl<'a> CompileSession<'a> {
    pub fn new(compiler: &'a Compiler, graph: &'a NetworkGraph, tables: IndexTables) -> Result<Self, CompileError> {
        compiler.options.validate()?;
        graph.validate()?;
        if let Some(int8) = &compiler.int8_graph {
            int8.validate()?;
        }
        let segments = patterns::segment(&graph.layers, &compiler.patterns)?;
        let owners = patterns::claim_owners(&segments, graph.layers.len())?;
        let options = &compiler.options;
        let weights = WeightArtifact::new(&options.net_name, options.chunk_size, options.skip_weights);
        let int8_weights = compiler.int8_graph.as_ref().map(|_| {
            WeightArtifact::new(
                &format!("{}_int8", options.net_name),
                options.chunk_size,
                options.skip_weights,
            )
        });
        debug!("Segmented {} layers into {} patterns", graph.layers.len(), segments.len());
        Ok(Self {
            compiler,
            graph,
            segments,
            owners,
            tables,
            weights,
            int8_weights,
            bias_terms: HashMap::new(),
            tables_emitted: HashSet::new(),
            recognizes_region: false,
            constructor: Constructor::default(),
            functions: Vec::new(),
            diagnostics: Vec::new(),
        })
    }

    pub fn tables(&self) -> &IndexTables {
        &self.tables
    }

    fn net(&self) -> &'a str {
        &self.compiler.options.net_name
    }

    fn register_blobs(&mut self, pos: usize) {
        let graph = self.graph;
        let node = &graph.layers[pos];
        for input in &node.inputs {
            self.tables.blob_slot(input);
        }
        // Members of fused groups keep their own slots even when their kind runs in place.
        let owner = self.segments[self.owners[pos]].kind;
        let in_place = matches!(owner, FusedKind::Reshape | FusedKind::Softmax | FusedKind::Sigmoid);
        for (i, output) in node.outputs.iter().enumerate() {
            match node.inputs.first() {
                Some(source)
                    if owner == FusedKind::Split
                        || (in_place && i == 0 && !has_split_fan_out(graph, source)) =>
                {
                    let slot = self.tables.alias_blob(output, source);
                    debug!("Aliased {} to {} (slot {})", output, source, slot);
                }
                _ => {
                    self.tables.blob_slot(output);
                }
            }
        }
    }

    /// Writes the weights of a weight-bearing segment once and records its constructor loads.
    /// Returns the bias flag the emitted call carries, or `None` when nothing is loaded.
    fn load_weights(&mut self, seg: &FusedPattern) -> Result<Option<bool>, CompileError> {
        let graph = self.graph;
        let node = &graph.layers[seg.anchor];
        if !seg.kind.is_weight_bearing() || ops::resize_mode(graph, node).is_some() {
            return Ok(None);
        }
        let slot = self.tables.layer_slot(&node.name);
        if let Some(&bias_term) = self.bias_terms.get(&slot) {
            return Ok(Some(bias_term));
        }
        let folded = fold::transform(&graph.layers, seg.anchor, seg.roles.batch_norm, seg.roles.scale)?;
        let binary = node.op().is_binary();
        let fold_flag = metadata::is_fold(graph, &self.compiler.options, node);
        let symbol = format!("{}_wt", self.weights.prefix());
        let load = |j: usize, offset: u64| {
            let mut args = vec![Arg::symbol(&symbol), Arg::Int(offset as i64)];
            if fold_flag {
                args.push(Arg::Flag(Variant::SpeedupRpn));
            }
            Stmt::on(Target::LayerBlob(slot, j), "LoadCPU", args)
        };
        let reshape = |j: usize, dims: &[usize]| Stmt::on(Target::LayerBlob(slot, j), "ReshapeCPU", ints(dims));

        let mut init = vec![
            Stmt::Comment(node.name.clone()),
            Stmt::on(
                Target::LayerSlot(slot),
                "resize",
                vec![Arg::Int(if binary { 3 } else { 2 }), Arg::symbol("{}")],
            ),
        ];
        let shape = node
            .weight_shape(0)
            .unwrap_or_else(|| folded.weight.shape.to_vec());
        init.push(reshape(0, &shape));
        let token = self.weights.write(&folded.weight.to_le_bytes());
        init.push(load(0, token.offset));
        let outputs = match &folded.bias {
            Some(bias) => {
                init.push(reshape(1, &[bias.len()]));
                let token = self.weights.write(&bias.to_le_bytes());
                init.push(load(1, token.offset));
                bias.len()
            }
            None => shape.first().copied().unwrap_or(0),
        };
        if binary {
            init.push(reshape(2, &[outputs]));
            self.constructor.binarize.push(Stmt::cnn(
                "binarize_weight",
                vec![Arg::Weight(slot, 0), Arg::Weight(slot, 2)],
            ));
        }
        self.constructor.layer_init.extend(init);
        self.load_int8(slot, node, fold_flag)?;

        let group = node.conv_param().group();
        let grouped_conv = matches!(
            seg.kind,
            FusedKind::Conv | FusedKind::ConvRelu | FusedKind::ConvEltwiseRelu
        );
        if grouped_conv && group > 1 {
            self.constructor.layer_init.push(Stmt::on(
                Target::Object("group_conv_layers".to_string()),
                "push_back",
                vec![Arg::symbol(format!("std::make_pair({}, {})", slot, group))],
            ));
        }
        self.bias_terms.insert(slot, folded.bias_term);
        Ok(Some(folded.bias_term))
    }

    /// Companion loads from the quantized graph for a layer that has a fixed-point twin.
    fn load_int8(&mut self, slot: usize, node: &LayerNode, fold_flag: bool) -> Result<(), CompileError> {
        let compiler = self.compiler;
        let (Some(int8), Some(stream)) = (compiler.int8_graph.as_ref(), self.int8_weights.as_mut()) else {
            return Ok(());
        };
        let Some(pos) = int8.position(&node.name) else {
            return Ok(());
        };
        let layer = &int8.layers[pos];
        if !layer.op().is_ristretto() {
            return Ok(());
        }
        let (batch_norm, scale, _) = patterns::bn_tail(&int8.layers, pos + 1);
        let folded = fold::transform(&int8.layers, pos, batch_norm, scale)?;
        let q = layer.quantization.clone().unwrap_or_default();
        let fl_bias = match q.fl_params_bias {
            None | Some(1000) => q.fl_params,
            Some(v) => v,
        };
        let bw_bias = match q.bw_params_bias {
            None | Some(0) => q.bw_params,
            Some(v) => v,
        };
        let suffix = if fold_flag { "_FOLD" } else { "" };
        let slot_arg = Arg::Int(slot as i64);
        let token = stream.write(&folded.weight.to_le_bytes());
        let mut init = vec![Stmt::free(
            &format!("LOAD_INT_W{}", suffix),
            vec![
                slot_arg.clone(),
                Arg::Int(token.offset as i64),
                Arg::Int(q.fl_params as i64),
                Arg::Int(q.bw_params as i64),
            ],
        )];
        match &folded.bias {
            Some(bias) => {
                let token = stream.write(&bias.to_le_bytes());
                init.push(Stmt::free(
                    &format!("LOAD_INT_B{}", suffix),
                    vec![
                        slot_arg,
                        Arg::Int(token.offset as i64),
                        Arg::Int(fl_bias as i64),
                        Arg::Int(bw_bias as i64),
                    ],
                ));
            }
            None => init.push(Stmt::free(
                "SET_SHIFTN_B",
                vec![slot_arg, Arg::Int(fl_bias as i64)],
            )),
        }
        self.constructor.layer_init.extend(init);
        Ok(())
    }

    /// Per-class tables a segment contributes to the constructor, each at most once.
    fn record_metadata(&mut self, seg: &FusedPattern) {
        let graph = self.graph;
        let node = &graph.layers[seg.anchor];
        let class_names = metadata::parse_param_str(&graph.class_names);
        match seg.kind {
            FusedKind::Detection if self.tables_emitted.insert("class_map") => {
                let map = metadata::class_map(graph, node);
                self.constructor.metadata.extend(metadata::class_map_stmts(&map));
            }
            FusedKind::AttributeDetection if self.tables_emitted.insert("has_attribute") => {
                let flags = metadata::capability_flags(&class_names, metadata::attribute_vocabulary(node));
                self.constructor
                    .metadata
                    .extend(metadata::flag_stmts("bool_t", "has_attribute", &flags));
            }
            _ => {}
        }
        let (object, rpn) = match seg.kind {
            FusedKind::ProposalNway => (
                "anchors",
                node.proposal_nway.as_ref().map(|p| p.rpn_option.as_slice()),
            ),
            FusedKind::Detection => (
                "detection_anchors",
                node.detection.as_ref().map(|d| d.rpn_option.as_slice()),
            ),
            _ => return,
        };
        if let Some(rpn) = rpn.filter(|r| !r.is_empty()) {
            if self.tables_emitted.insert(object) {
                self.constructor
                    .layer_init
                    .extend(metadata::anchor_stmts(&node.name, object, rpn));
            }
        }
    }

    fn record_role_metadata(&mut self, role: FunctionRole) {
        let class_names = metadata::parse_param_str(&self.graph.class_names);
        let (name, vocabulary): (&'static str, &[&str]) = match role {
            FunctionRole::MaskDetection => ("has_mask", &metadata::EXTENDED_CLASSES[..]),
            FunctionRole::FalsePositive => ("checks_fp", &metadata::FALSE_POSITIVE_CLASSES[..]),
            FunctionRole::Recognition => {
                self.recognizes_region = true;
                return;
            }
            _ => return,
        };
        if self.tables_emitted.insert(name) {
            let flags = metadata::capability_flags(&class_names, vocabulary);
            self.constructor
                .metadata
                .extend(metadata::flag_stmts("bool_t", name, &flags));
        }
    }

    fn gap(&mut self, window: &WindowSpec, node: &LayerNode) {
        warn!(
            "No emitter for layer {} ({}) in {}; skipped",
            node.name, node.kind, window.function
        );
        self.diagnostics.push(Diagnostic {
            function: window.function.clone(),
            layer: node.name.clone(),
            kind: node.kind.clone(),
        });
    }

    /// Lowers one segment into `body`. Blobs are registered whether or not anything is emitted.
    fn emit_segment(&mut self, window: &WindowSpec, seg: &FusedPattern, body: &mut FunctionBody) -> Result<(), CompileError> {
        let graph = self.graph;
        let compiler = self.compiler;
        let options = &compiler.options;
        for pos in seg.span() {
            self.register_blobs(pos);
        }
        let node = &graph.layers[seg.anchor];
        if seg.kind == FusedKind::Unknown {
            self.gap(window, node);
            return Ok(());
        }
        if seg.kind == FusedKind::Sigmoid && options.is_skipped(&node.name) {
            debug!("Dropped {}", node.name);
            return Ok(());
        }
        if seg.kind == FusedKind::GridConv {
            return self.emit_grid_conv(window, seg, body);
        }
        let bias_term = self.load_weights(seg)?.unwrap_or(false);
        self.record_metadata(seg);

        let mut stmts = Vec::new();
        let ctx = ops::EmitContext {
            graph,
            tables: &self.tables,
            options,
            role: window.role,
            seg,
            bias_term,
        };
        if !ops::dispatch_builtin(&ctx, &mut stmts)? {
            self.gap(window, node);
            return Ok(());
        }
        match seg.kind {
            FusedKind::Segmentation => {
                let slot = input_slot(&self.tables, node, 0)?;
                body.rebind(slot, "seg_map");
            }
            FusedKind::CurveFitting => {
                let second = input_slot(&self.tables, node, 1)?;
                let first = input_slot(&self.tables, node, 0)?;
                body.rebind(second, "*ld_maps[0]");
                body.rebind(first, "*ld_maps[1]");
            }
            _ => {}
        }
        // Splits and the rebinding heads lower to no call.
        if stmts.is_empty() {
            return Ok(());
        }
        body.stmts.push(Stmt::Comment(node.name.clone()));
        if ops::is_speedup_disabled(graph, options, node) {
            body.stmts.push(Stmt::Branch {
                variant: Variant::SpeedupRpn,
                enabled: Vec::new(),
                disabled: stmts,
            });
        } else {
            body.stmts.extend(stmts);
        }
        body.stmts.push(self.checkpoint(window, &node.name));
        Ok(())
    }

    /// Loads every grid cell, then emits the fused call with the per-node lowering as its
    /// fallback. The block gets one checkpoint, outside the branch.
    fn emit_grid_conv(&mut self, window: &WindowSpec, seg: &FusedPattern, body: &mut FunctionBody) -> Result<(), CompileError> {
        let graph = self.graph;
        let compiler = self.compiler;
        let options = &compiler.options;
        let mut fallback = Vec::new();
        for member in patterns::grid_conv_members(seg) {
            let node = &graph.layers[member.anchor];
            let bias_term = self.load_weights(&member)?.unwrap_or(false);
            let ctx = ops::EmitContext {
                graph,
                tables: &self.tables,
                options,
                role: window.role,
                seg: &member,
                bias_term,
            };
            let mut stmts = Vec::new();
            if !ops::dispatch_builtin(&ctx, &mut stmts)? {
                self.gap(window, node);
                continue;
            }
            fallback.push(Stmt::Comment(node.name.clone()));
            fallback.extend(stmts);
        }
        let ctx = ops::EmitContext {
            graph,
            tables: &self.tables,
            options,
            role: window.role,
            seg,
            bias_term: true,
        };
        let mut fused = Vec::new();
        ops::dispatch_builtin(&ctx, &mut fused)?;
        let anchor = &graph.layers[seg.anchor];
        body.stmts.push(Stmt::Comment(anchor.name.clone()));
        body.stmts.push(Stmt::Branch {
            variant: Variant::GridConv,
            enabled: fused,
            disabled: fallback,
        });
        body.stmts.push(self.checkpoint(window, &anchor.name));
        Ok(())
    }

    fn checkpoint(&self, window: &WindowSpec, label: &str) -> Stmt {
        Stmt::Checkpoint {
            tag: format!("{}::{}::{}", self.net(), window.function, label),
            terminal: false,
        }
    }

    /// Role-specific tail after the exit layer, reading the exit layer's first output.
    fn epilogue(&self, window: &WindowSpec, exit: &LayerNode, body: &mut FunctionBody) -> Result<(), CompileError> {
        let top = match exit.outputs.first().and_then(|b| self.tables.lookup_blob(b)) {
            Some(slot) => Arg::Blob(slot),
            None => return Ok(()),
        };
        match window.role {
            FunctionRole::MaskDetection => {
                body.stmts.push(Stmt::Comment("mask_prob".to_string()));
                body.stmts.push(Stmt::cnn("sigmoid", vec![top.clone(), top.clone()]));
                body.stmts.push(self.checkpoint(window, "mask_prob"));
                body.stmts.push(Stmt::Comment("mask_detection".to_string()));
                body.stmts.push(Stmt::on(
                    Target::Object("this->".to_string()),
                    "get_output",
                    vec![top, Arg::symbol("masks")],
                ));
                body.stmts.push(self.checkpoint(window, "mask_detection"));
            }
            FunctionRole::FalsePositive => {
                body.stmts.push(Stmt::Comment("fp_recognition".to_string()));
                body.stmts.push(Stmt::cnn(
                    "get_false_positive_output",
                    vec![
                        top,
                        Arg::symbol("false_positives"),
                        Arg::symbol("options.FPR_THRES"),
                    ],
                ));
                body.stmts.push(self.checkpoint(window, "fp_recognition"));
            }
            _ => {}
        }
        Ok(())
    }

    pub fn compile_window(&mut self, window: &WindowSpec) -> Result<(), CompileError> {
        let graph = self.graph;
        let start = graph
            .layers
            .iter()
            .position(|l| window.entry.contains(&l.name))
            .ok_or_else(|| CompileError::MissingAnchor {
                function: window.function.clone(),
                names: window.entry.clone(),
            })?;
        let end = (start..graph.layers.len())
            .find(|&p| window.exit.contains(&graph.layers[p].name))
            .ok_or_else(|| CompileError::MissingAnchor {
                function: window.function.clone(),
                names: window.exit.clone(),
            })?;
        info!(
            "Compiling {} from {} to {}",
            window.function, graph.layers[start].name, graph.layers[end].name
        );
        self.record_role_metadata(window.role);

        let mut body = FunctionBody::new(&window.function, &window.signature);
        let first = self.owners[start];
        let last = self.owners[end];
        for s in first..=last {
            let seg = self.segments[s].clone();
            if seg.anchor < start {
                // Claimed by a pattern that begins before the window.
                for pos in seg.span() {
                    self.register_blobs(pos);
                }
                continue;
            }
            self.emit_segment(window, &seg, &mut body)?;
        }
        self.epilogue(window, &graph.layers[end], &mut body)?;
        body.finish();
        info!(
            "Compiled {}: {} checkpoints, terminal {:?}",
            window.function,
            body.checkpoints().len(),
            body.terminal_tag()
        );
        self.functions.push(body);
        Ok(())
    }

    /// Activation shifts of every registered blob with a valid side-table entry.
    fn record_shifts(&mut self) {
        let Some(info) = self.compiler.quantize_info.as_ref() else {
            return;
        };
        for (name, slot) in self.tables.blobs() {
            if name.contains("split") {
                continue;
            }
            if let Some(shift) = info.shift(name) {
                self.constructor.shifts.push(Stmt::free(
                    "SET_SHIFTN_D",
                    vec![Arg::Int(slot as i64), Arg::Int(shift as i64)],
                ));
                self.constructor.shifts.push(Stmt::Comment(name.to_string()));
            }
        }
    }

    pub fn finish(mut self) -> Result<CompilationResult, CompileError> {
        self.record_shifts();
        self.constructor.blob_count = self.tables.blob_count();
        self.constructor.layer_count = self.tables.layer_count();
        let region = self
            .compiler
            .options
            .region
            .as_deref()
            .filter(|_| self.recognizes_region);
        let classes = ClassTable::new(self.graph, region);
        let code = generate::generate_source(&generate::SourceParts {
            net: self.net(),
            constructor: &self.constructor,
            functions: &self.functions,
            classes: &classes,
            weights: &self.weights,
            int8_weights: self.int8_weights.as_ref(),
        })?;
        info!(
            "Wrote {} weight bytes in {} chunks",
            self.weights.total_bytes(),
            self.weights.chunks().len()
        );
        if let Some(int8) = &self.int8_weights {
            info!(
                "Wrote {} int8 weight bytes in {} chunks",
                int8.total_bytes(),
                int8.chunks().len()
            );
        }
        Ok(CompilationResult {
            code,
            weights: self.weights,
            int8_weights: self.int8_weights,
            functions: self.functions,
            constructor: self.constructor,
            diagnostics: self.diagnostics,
            tables: self.tables,
        })
    }
}

fn input_slot(tables: &IndexTables, node: &LayerNode, i: usize) -> Result<usize, CompileError> {
    node.inputs
        .get(i)
        .and_then(|b| tables.lookup_blob(b))
        .ok_or_else(|| CompileError::InvalidModel {
            layer: node.name.clone(),
            reason: format!("input {} has no slot", i),
        })
}
