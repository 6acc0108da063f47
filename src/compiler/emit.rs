//! Call descriptors produced by the emission stage.
//!
//! Descriptors stay structured until `generate` renders them, so variant branches and blob
//! rebinding can be applied without touching text.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Cpu,
    Int,
    Gpu,
    Fp16,
}

impl Platform {
    pub const ALL: [Platform; 4] = [Platform::Cpu, Platform::Int, Platform::Gpu, Platform::Fp16];

    pub fn suffix(self) -> &'static str {
        match self {
            Platform::Cpu => "CPU",
            Platform::Int => "INT",
            Platform::Gpu => "GPU",
            Platform::Fp16 => "FP16",
        }
    }
}

/// Conditional-compilation axis left for the consumer to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    SpeedupRpn,
    SpeedupFc2Conv,
    /// Fused grid conv on cuDNN builds, chosen again at run time by `UseGPU()`.
    GridConv,
    Platform(Platform),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    /// `std::vector<const Tensor*> {&a, &b}`
    ConstTensors,
    /// `std::vector<Tensor*> {&a, &b}`
    Tensors,
    Ints,
    Floats,
    /// Plain `{a, b}` initializer.
    Braced,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// Data blob slot.
    Blob(usize),
    /// One dimension (1-based, `d1`..`d4`) of a data blob.
    BlobDim(usize, u8),
    /// Tensor `index` of a layer slot.
    Weight(usize, usize),
    Int(i64),
    Float(f32),
    Bool(bool),
    /// Runtime identifier passed through verbatim.
    Symbol(String),
    /// Flag whose value depends on a variant, e.g. `FOLD`.
    Flag(Variant),
    List(ListKind, Vec<Arg>),
}

impl Arg {
    pub fn ints<I: IntoIterator<Item = i64>>(items: I) -> Self {
        Arg::List(ListKind::Ints, items.into_iter().map(Arg::Int).collect())
    }

    pub fn floats<I: IntoIterator<Item = f32>>(items: I) -> Self {
        Arg::List(ListKind::Floats, items.into_iter().map(Arg::Float).collect())
    }

    pub fn symbol(s: impl Into<String>) -> Self {
        Arg::Symbol(s.into())
    }

    fn rebind(&mut self, slot: usize, symbol: &str) {
        match self {
            Arg::Blob(s) if *s == slot => *self = Arg::Symbol(symbol.to_string()),
            Arg::BlobDim(s, d) if *s == slot => {
                let d = *d;
                *self = Arg::Symbol(format!("{}.d{}", symbol, d));
            }
            Arg::List(_, items) => items.iter_mut().for_each(|a| a.rebind(slot, symbol)),
            _ => {}
        }
    }
}

/// Receiver of a call.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// `cnn->op(...)`
    Cnn,
    /// `op(...)`
    Free,
    /// `name.op(...)`, or `name->op(...)` when the name ends with `->`.
    Object(String),
    /// `layer_blobs[i].op(...)`
    LayerSlot(usize),
    /// `layer_blobs[i][j].op(...)`
    LayerBlob(usize, usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub target: Target,
    pub op: String,
    pub args: Vec<Arg>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Comment(String),
    Call(Call),
    /// `ty name = value;`
    Declare { ty: String, name: String, value: Arg },
    /// `target = value;`
    Assign { target: String, value: Arg },
    /// `{ ... }` scope.
    Block(Vec<Stmt>),
    /// Alternative bodies selected by a variant.
    Branch {
        variant: Variant,
        enabled: Vec<Stmt>,
        disabled: Vec<Stmt>,
    },
    Checkpoint { tag: String, terminal: bool },
}

impl Stmt {
    pub fn cnn(op: &str, args: Vec<Arg>) -> Self {
        Self::on(Target::Cnn, op, args)
    }

    pub fn free(op: &str, args: Vec<Arg>) -> Self {
        Self::on(Target::Free, op, args)
    }

    pub fn on(target: Target, op: &str, args: Vec<Arg>) -> Self {
        Stmt::Call(Call {
            target,
            op: op.to_string(),
            args,
        })
    }

    pub fn declare(ty: &str, name: &str, value: Arg) -> Self {
        Stmt::Declare {
            ty: ty.to_string(),
            name: name.to_string(),
            value,
        }
    }

    fn rebind(&mut self, slot: usize, symbol: &str) {
        match self {
            Stmt::Call(call) => call.args.iter_mut().for_each(|a| a.rebind(slot, symbol)),
            Stmt::Declare { value, .. } | Stmt::Assign { value, .. } => value.rebind(slot, symbol),
            Stmt::Block(body) => body.iter_mut().for_each(|s| s.rebind(slot, symbol)),
            Stmt::Branch {
                enabled, disabled, ..
            } => enabled
                .iter_mut()
                .chain(disabled.iter_mut())
                .for_each(|s| s.rebind(slot, symbol)),
            Stmt::Comment(_) | Stmt::Checkpoint { .. } => {}
        }
    }

    fn visit_checkpoints<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Stmt::Checkpoint { tag, .. } => out.push(tag),
            Stmt::Block(body) => body.iter().for_each(|s| s.visit_checkpoints(out)),
            Stmt::Branch {
                enabled, disabled, ..
            } => enabled
                .iter()
                .chain(disabled.iter())
                .for_each(|s| s.visit_checkpoints(out)),
            _ => {}
        }
    }
}

/// Descriptors of one compiled window.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionBody {
    pub name: String,
    /// Parameter list, without parentheses.
    pub signature: String,
    pub stmts: Vec<Stmt>,
}

impl FunctionBody {
    pub fn new(name: &str, signature: &str) -> Self {
        Self {
            name: name.to_string(),
            signature: signature.to_string(),
            stmts: Vec::new(),
        }
    }

    /// Replaces every earlier use of `slot` with an externally provided symbol.
    pub fn rebind(&mut self, slot: usize, symbol: &str) {
        self.stmts.iter_mut().for_each(|s| s.rebind(slot, symbol));
    }

    pub fn checkpoints(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.stmts.iter().for_each(|s| s.visit_checkpoints(&mut out));
        out
    }

    /// Marks the last top-level checkpoint as the function's end marker.
    pub fn finish(&mut self) {
        if let Some(Stmt::Checkpoint { terminal, .. }) = self
            .stmts
            .iter_mut()
            .rev()
            .find(|s| matches!(s, Stmt::Checkpoint { .. }))
        {
            *terminal = true;
        }
    }

    pub fn terminal_tag(&self) -> Option<&str> {
        self.stmts.iter().find_map(|s| match s {
            Stmt::Checkpoint {
                tag,
                terminal: true,
            } => Some(tag.as_str()),
            _ => None,
        })
    }

    /// Functions without checkpoints emitted nothing and are left out of the text.
    pub fn is_empty(&self) -> bool {
        self.checkpoints().is_empty()
    }
}

/// Descriptors of the generated constructor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Constructor {
    pub blob_count: usize,
    pub layer_count: usize,
    /// Layer storage, weight loads and anchors, in emission order.
    pub layer_init: Vec<Stmt>,
    /// Activation shifts of the int8 path.
    pub shifts: Vec<Stmt>,
    /// Per-class tables and flags.
    pub metadata: Vec<Stmt>,
    /// Repeated in every platform constructor.
    pub binarize: Vec<Stmt>,
}
