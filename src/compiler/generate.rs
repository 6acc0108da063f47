//! Source text materialization.
//!
//! Everything upstream works on descriptors; this is the only place that knows the textual
//! calling convention, the preprocessor spelling of variants and the layout of the generated
//! translation unit.
use super::emit::{Arg, Constructor, FunctionBody, ListKind, Platform, Stmt, Target, Variant};
use super::metadata::ClassTable;
use super::writer::WeightArtifact;
use super::CompileError;
use std::io::{self, Write};

/// Everything that ends up in one generated translation unit.
pub struct SourceParts<'a> {
    pub net: &'a str,
    pub constructor: &'a Constructor,
    pub functions: &'a [FunctionBody],
    pub classes: &'a ClassTable,
    pub weights: &'a WeightArtifact,
    pub int8_weights: Option<&'a WeightArtifact>,
}

fn pad(indent: usize) -> String {
    "  ".repeat(indent)
}

fn float(v: f32) -> String {
    format!("{:?}", v)
}

pub fn variant_macro(variant: Variant) -> String {
    match variant {
        Variant::SpeedupRpn => "SPEEDUP_RPN".to_string(),
        Variant::SpeedupFc2Conv => "SPEEDUP_FC2CONV".to_string(),
        Variant::GridConv => "SPEEDUP_GRIDCONV".to_string(),
        Variant::Platform(p) => format!("USE_{}", p.suffix()),
    }
}

fn flag(variant: Variant) -> String {
    match variant {
        Variant::SpeedupRpn => "FOLD".to_string(),
        Variant::SpeedupFc2Conv => "FC2CONV".to_string(),
        Variant::GridConv | Variant::Platform(_) => variant_macro(variant),
    }
}

fn join(items: &[Arg]) -> String {
    items.iter().map(render_arg).collect::<Vec<_>>().join(", ")
}

fn address_of(arg: &Arg) -> String {
    let text = render_arg(arg);
    if text.starts_with('&') {
        text
    } else {
        format!("&{}", text)
    }
}

pub fn render_arg(arg: &Arg) -> String {
    match arg {
        Arg::Blob(i) => format!("data_blobs[{}]", i),
        Arg::BlobDim(i, d) => format!("data_blobs[{}].d{}", i, d),
        Arg::Weight(i, j) => format!("layer_blobs[{}][{}]", i, j),
        Arg::Int(v) => v.to_string(),
        Arg::Float(v) => float(*v),
        Arg::Bool(b) => b.to_string(),
        Arg::Symbol(s) => s.clone(),
        Arg::Flag(v) => flag(*v),
        Arg::List(kind, items) => match kind {
            ListKind::ConstTensors | ListKind::Tensors => {
                let ty = if *kind == ListKind::ConstTensors {
                    "const Tensor*"
                } else {
                    "Tensor*"
                };
                let refs: Vec<String> = items.iter().map(address_of).collect();
                format!("std::vector<{}> {{{}}}", ty, refs.join(", "))
            }
            ListKind::Ints => format!("std::vector<int> {{{}}}", join(items)),
            ListKind::Floats => format!("std::vector<float> {{{}}}", join(items)),
            ListKind::Braced => format!("{{{}}}", join(items)),
        },
    }
}

fn render_target(target: &Target, op: &str) -> String {
    match target {
        Target::Cnn => format!("cnn->{}", op),
        Target::Free => op.to_string(),
        Target::Object(name) if name.ends_with("->") => format!("{}{}", name, op),
        Target::Object(name) => format!("{}.{}", name, op),
        Target::LayerSlot(i) => format!("layer_blobs[{}].{}", i, op),
        Target::LayerBlob(i, j) => format!("layer_blobs[{}][{}].{}", i, j, op),
    }
}

fn write_stmts<W: Write>(w: &mut W, stmts: &[Stmt], indent: usize) -> io::Result<()> {
    for stmt in stmts {
        write_stmt(w, stmt, indent)?;
    }
    Ok(())
}

fn write_stmt<W: Write>(w: &mut W, stmt: &Stmt, indent: usize) -> io::Result<()> {
    let p = pad(indent);
    match stmt {
        Stmt::Comment(text) => writeln!(w, "{}// {}", p, text),
        Stmt::Call(call) => writeln!(
            w,
            "{}{}({});",
            p,
            render_target(&call.target, &call.op),
            join(&call.args)
        ),
        Stmt::Declare { ty, name, value } => {
            writeln!(w, "{}{} {} = {};", p, ty, name, render_arg(value))
        }
        Stmt::Assign { target, value } => writeln!(w, "{}{} = {};", p, target, render_arg(value)),
        Stmt::Block(body) => {
            writeln!(w, "{}{{", p)?;
            write_stmts(w, body, indent + 1)?;
            writeln!(w, "{}}}", p)
        }
        Stmt::Branch {
            variant: Variant::GridConv,
            enabled,
            disabled,
        } => write_grid_branch(w, enabled, disabled, indent),
        Stmt::Branch {
            variant,
            enabled,
            disabled,
        } => {
            let name = variant_macro(*variant);
            match (enabled.is_empty(), disabled.is_empty()) {
                (true, true) => Ok(()),
                (true, false) => {
                    writeln!(w, "#ifndef {}", name)?;
                    write_stmts(w, disabled, indent)?;
                    writeln!(w, "#endif")
                }
                (false, true) => {
                    writeln!(w, "#ifdef {}", name)?;
                    write_stmts(w, enabled, indent)?;
                    writeln!(w, "#endif")
                }
                (false, false) => {
                    writeln!(w, "#ifndef {}", name)?;
                    write_stmts(w, disabled, indent)?;
                    writeln!(w, "#else")?;
                    write_stmts(w, enabled, indent)?;
                    writeln!(w, "#endif")
                }
            }
        }
        Stmt::Checkpoint { tag, terminal } => {
            let marker = if *terminal { "EVT_END" } else { "EVT_CHECK" };
            writeln!(w, "{}{}(\"{}\");", p, marker, tag)
        }
    }
}

/// Fused side behind the cuDNN guard and a run-time `UseGPU()` switch. The unfused statements
/// run on every other path.
fn write_grid_branch<W: Write>(w: &mut W, enabled: &[Stmt], disabled: &[Stmt], indent: usize) -> io::Result<()> {
    let p = pad(indent);
    let guard = format!("#if defined({}) && defined(USE_CUDNN)", variant_macro(Variant::GridConv));
    writeln!(w, "{}", guard)?;
    writeln!(w, "{}if (UseGPU()) {{", p)?;
    write_stmts(w, enabled, indent + 1)?;
    writeln!(w, "{}}} else {{", p)?;
    writeln!(w, "#endif")?;
    write_stmts(w, disabled, indent)?;
    writeln!(w, "{}", guard)?;
    writeln!(w, "{}}}", p)?;
    writeln!(w, "#endif")
}

/// Renders statements at function-body indentation. Used by tests and diagnostics.
pub fn render_stmts(stmts: &[Stmt]) -> Result<String, CompileError> {
    let mut code = Vec::new();
    write_stmts(&mut code, stmts, 1)?;
    Ok(String::from_utf8(code)?)
}

fn write_switch<W: Write>(w: &mut W, variant: Variant, name: &str) -> io::Result<()> {
    let m = variant_macro(variant);
    writeln!(w, "#ifdef {}", m)?;
    writeln!(w, "#define {} true", name)?;
    writeln!(w, "#else // {}", m)?;
    writeln!(w, "#define {} false", name)?;
    writeln!(w, "#endif // {}", m)?;
    writeln!(w)
}

fn write_defines<W: Write>(w: &mut W, net: &str, int8: bool) -> io::Result<()> {
    write_switch(w, Variant::SpeedupRpn, "FOLD")?;
    write_switch(w, Variant::SpeedupFc2Conv, "FC2CONV")?;
    if !int8 {
        return Ok(());
    }
    let load = |slot: usize, bits: &str, fold: bool| {
        format!(
            "layer_blobs[idx][{}].LoadInt({}_int8_wt, offset, ({} - 8) + (shift_bit), ({} - 8) + (max_bit){})",
            slot,
            net,
            bits,
            bits,
            if fold { ", FOLD" } else { "" }
        )
    };
    let loads = [
        ("LOAD_INT_W", load(0, "INT_BIT_W", false)),
        ("LOAD_INT_B", load(1, "INT_BIT_B", false)),
        ("LOAD_INT_W_FOLD", load(0, "INT_BIT_W", true)),
        ("LOAD_INT_B_FOLD", load(1, "INT_BIT_B", true)),
    ];
    let shifts = [
        ("SET_SHIFTN_W", "layer_blobs[idx][0].shift_n = (INT_BIT_W - 8) + (shift_bit)"),
        ("SET_SHIFTN_B", "layer_blobs[idx][1].shift_n = (INT_BIT_B - 8) + (shift_bit)"),
        ("SET_SHIFTN_D", "data_blobs[idx].shift_n = (INT_BIT_B - 8) + (shift_bit)"),
    ];
    let load_params = "(idx, offset, shift_bit, max_bit)";
    let shift_params = "(idx, shift_bit)";
    writeln!(w, "#ifdef {}", variant_macro(Variant::Platform(Platform::Int)))?;
    for (name, body) in &loads {
        writeln!(w, "#define {}{} {}", name, load_params, body)?;
    }
    for (name, body) in &shifts {
        writeln!(w, "#define {}{} {}", name, shift_params, body)?;
    }
    writeln!(w, "#else")?;
    for (name, _) in &loads {
        writeln!(w, "#define {}{}", name, load_params)?;
    }
    for (name, _) in &shifts {
        writeln!(w, "#define {}{}", name, shift_params)?;
    }
    writeln!(w, "#endif")?;
    writeln!(w)
}

fn write_weight_defs<W: Write>(w: &mut W, artifact: &WeightArtifact) -> io::Result<()> {
    let names: Vec<&str> = artifact.chunks().iter().map(|c| c.name.as_str()).collect();
    let bases: Vec<String> = artifact.chunks().iter().map(|c| c.base.to_string()).collect();
    let p = artifact.prefix();
    writeln!(
        w,
        "extern unsigned char {};",
        names.iter().map(|n| format!("{}[]", n)).collect::<Vec<_>>().join(", ")
    )?;
    writeln!(w, "const unsigned char* {}_wt[] = {{ {} }};", p, names.join(", "))?;
    writeln!(w, "const unsigned int {}_wt_base[] = {{ {} }};", p, bases.join(", "))?;
    writeln!(w)
}

fn write_constructor<W: Write>(w: &mut W, parts: &SourceParts) -> io::Result<()> {
    let net = parts.net;
    let ctor = parts.constructor;
    writeln!(w, "{}::{}() {{", net, net)?;
    writeln!(w, "  data_blobs.resize({}, {{}});", ctor.blob_count)?;
    writeln!(w, "  layer_blobs.resize({});", ctor.layer_count)?;
    writeln!(w, "  for (auto &blob : data_blobs) {{")?;
    writeln!(w, "    blob.Initialize();")?;
    writeln!(w, "  }}")?;
    writeln!(w, "  for (auto &layer_blob : layer_blobs) {{")?;
    writeln!(w, "    for (auto &blob : layer_blob) {{")?;
    writeln!(w, "      blob.Initialize();")?;
    writeln!(w, "    }}")?;
    writeln!(w, "  }}")?;
    write_stmts(w, &ctor.layer_init, 1)?;
    write_stmts(w, &ctor.shifts, 1)?;
    write_stmts(w, &ctor.metadata, 1)?;
    writeln!(w, "}}")?;
    writeln!(w)?;

    for platform in Platform::ALL {
        let guard = match platform {
            Platform::Cpu => None,
            _ => Some(variant_macro(Variant::Platform(platform))),
        };
        if let Some(guard) = &guard {
            writeln!(w, "#ifdef {}", guard)?;
        }
        let concrete = format!("{}_{}", net, platform.suffix());
        writeln!(w, "{}::{}() {{", concrete, concrete)?;
        if platform == Platform::Int && parts.int8_weights.is_none() {
            writeln!(w, "  NOT_IMPLEMENT_ERROR;")?;
            writeln!(w, "}}")?;
        } else {
            writeln!(w, "  cnn = CNNTools_{}::GetInstance();", platform.suffix())?;
            writeln!(w, "  i2t = Image2Tensor_{}::GetInstance();", platform.suffix())?;
            writeln!(w, "  Initialize();")?;
            write_stmts(w, &ctor.binarize, 1)?;
            writeln!(w, "}}")?;
            writeln!(w, "REGISTER_NET({});", concrete)?;
        }
        // FP16 nests inside the GPU guard.
        match platform {
            Platform::Cpu => writeln!(w)?,
            Platform::Int => {
                writeln!(w, "#endif")?;
                writeln!(w)?;
            }
            Platform::Gpu => {}
            Platform::Fp16 => {
                writeln!(w, "#endif")?;
                writeln!(w, "#endif")?;
                writeln!(w)?;
            }
        }
    }
    Ok(())
}

fn write_class_functions<W: Write>(w: &mut W, net: &str, classes: &ClassTable) -> io::Result<()> {
    if classes.is_empty() {
        return Ok(());
    }
    let n = classes.names.len();
    let width = classes.names.iter().map(String::len).max().unwrap_or(0) + 1;
    let quoted: Vec<String> = classes.names.iter().map(|c| format!("\"{}\"", c)).collect();
    writeln!(w, "int32_t {}::GetNumClasses() const {{", net)?;
    writeln!(w, "  return {};", n)?;
    writeln!(w, "}}")?;
    writeln!(w)?;
    writeln!(w, "const char_t* {}::ClassName(int32_t index) const {{", net)?;
    writeln!(
        w,
        "  static const char_t class_names[{}][{}] = {{ {} }};",
        n,
        width,
        quoted.join(", ")
    )?;
    writeln!(w, "  return class_names[index];")?;
    writeln!(w, "}}")?;
    writeln!(w)?;
    if let Some(types) = &classes.types {
        writeln!(
            w,
            "IObjectDetector::ClassType {}::ClassType(int32_t index) const {{",
            net
        )?;
        writeln!(
            w,
            "  static const IObjectDetector::ClassType class_types[{}] = {{",
            n
        )?;
        let rows: Vec<String> = types.iter().map(|t| format!("    {}", t)).collect();
        writeln!(w, "{}", rows.join(",\n"))?;
        writeln!(w, "  }};")?;
        writeln!(w, "  return class_types[index];")?;
        writeln!(w, "}}")?;
        writeln!(w)?;
    }
    Ok(())
}

fn float_list(values: &[f32]) -> String {
    format!(
        "[{}]",
        values.iter().map(|v| float(*v)).collect::<Vec<_>>().join(", ")
    )
}

fn write_default_options<W: Write>(w: &mut W, net: &str, classes: &ClassTable) -> io::Result<()> {
    let Some((first, second)) = &classes.thresholds else {
        return Ok(());
    };
    writeln!(w, "void {}::SetDefaultOptions() {{", net)?;
    writeln!(w, "  options.NUM_DET_CLASSES = GetNumClasses();")?;
    writeln!(w, "  options.DETECTION_THRES1.resize(options.NUM_DET_CLASSES);")?;
    writeln!(w, "  options.DETECTION_THRES2.resize(options.NUM_DET_CLASSES);")?;
    writeln!(
        w,
        "  options.SetOption(\"DETECTION_THRES1\", \"{}\");",
        float_list(first)
    )?;
    writeln!(
        w,
        "  options.SetOption(\"DETECTION_THRES2\", \"{}\");",
        float_list(second)
    )?;
    writeln!(w, "}}")?;
    writeln!(w)
}

fn write_function<W: Write>(w: &mut W, net: &str, f: &FunctionBody) -> io::Result<()> {
    writeln!(w, "void {}::{}({}) {{", net, f.name, f.signature)?;
    writeln!(w, "  EVT_START;")?;
    write_stmts(w, &f.stmts, 1)?;
    writeln!(w, "}}")?;
    writeln!(w)
}

/// Renders the complete translation unit.
pub fn generate_source(parts: &SourceParts) -> Result<String, CompileError> {
    let mut code = Vec::new();
    let net = parts.net;
    writeln!(&mut code, "// Auto-generated by netforge")?;
    writeln!(&mut code, "#include \"{}.hpp\"", net.to_lowercase())?;
    writeln!(&mut code, "#include \"prof.hpp\"")?;
    writeln!(&mut code)?;
    write_defines(&mut code, net, parts.int8_weights.is_some())?;
    writeln!(&mut code, "namespace sv {{")?;
    writeln!(&mut code)?;
    write_weight_defs(&mut code, parts.weights)?;
    if let Some(int8) = parts.int8_weights {
        write_weight_defs(&mut code, int8)?;
    }
    write_constructor(&mut code, parts)?;
    write_class_functions(&mut code, net, parts.classes)?;
    write_default_options(&mut code, net, parts.classes)?;
    for f in parts.functions.iter().filter(|f| !f.is_empty()) {
        write_function(&mut code, net, f)?;
    }
    writeln!(&mut code, "}} // namespace sv")?;
    Ok(String::from_utf8(code)?)
}
