//! The three-address intermediate representation the engine interprets.
//!
//! Loading and lowering are the host's business: the engine expects canonical
//! switches, PHI nodes at block entries, prelowered atomics and vector
//! shuffles, and GetElementPtr offsets that are either folded to a constant
//! byte offset or expressed as (index operand, element size) pairs.

use crate::expr::{BinOp, Width, PTR_WIDTH};
use std::collections::HashMap;
use std::fmt;

pub type FunctionId = usize;
pub type GlobalId = usize;
pub type BlockId = usize;
pub type LocalId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Void,
    Int(Width),
    Pointer,
    Float,
    Double,
    Array(Box<Type>, u64),
    Struct(Vec<Type>),
    Vector(Box<Type>, u64),
}

impl Type {
    /// Width in bits when loaded into a register.
    pub fn width(&self) -> Width {
        match self {
            Type::Void => 0,
            Type::Int(width) => *width,
            Type::Pointer => PTR_WIDTH,
            Type::Float => 32,
            Type::Double => 64,
            Type::Vector(element, count) => element.width() * *count as Width,
            Type::Array(element, count) => element.width() * *count as Width,
            Type::Struct(fields) => fields.iter().map(Type::width).sum(),
        }
    }

    /// Size in bytes when stored to memory. Aggregates are packed.
    pub fn store_size(&self) -> u64 {
        match self {
            Type::Void => 0,
            Type::Int(width) => u64::from((width + 7) / 8),
            Type::Pointer => 8,
            Type::Float => 4,
            Type::Double => 8,
            Type::Array(element, count) => element.store_size() * count,
            Type::Struct(fields) => fields.iter().map(Type::store_size).sum(),
            Type::Vector(element, count) => element.store_size() * count,
        }
    }

    pub fn alignment(&self) -> u64 {
        match self {
            Type::Void => 1,
            Type::Int(width) => u64::from((width + 7) / 8).min(8).max(1),
            Type::Pointer | Type::Double => 8,
            Type::Float => 4,
            Type::Array(element, _) | Type::Vector(element, _) => element.alignment(),
            Type::Struct(fields) => fields.iter().map(Type::alignment).max().unwrap_or(1),
        }
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Type::Pointer)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Local(LocalId),
    ConstInt { width: Width, bits: u128 },
    ConstNull,
    Function(FunctionId),
    Global(GlobalId),
}

impl Operand {
    pub fn i32(value: i32) -> Operand {
        Operand::ConstInt {
            width: 32,
            bits: value as u32 as u128,
        }
    }

    pub fn i64(value: i64) -> Operand {
        Operand::ConstInt {
            width: 64,
            bits: value as u64 as u128,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastOp {
    Trunc,
    ZExt,
    SExt,
    BitCast,
    PtrToInt,
    IntToPtr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpPred {
    Eq,
    Ne,
    Ugt,
    Uge,
    Ult,
    Ule,
    Sgt,
    Sge,
    Slt,
    Sle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatOp {
    FAdd,
    FSub,
    FMul,
    FDiv,
    FRem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatCmpPred {
    Oeq,
    One,
    Olt,
    Ole,
    Ogt,
    Oge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatCastOp {
    FpTrunc,
    FpExt,
    FpToUi,
    FpToSi,
    UiToFp,
    SiToFp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Ret {
        value: Option<Operand>,
    },
    Br {
        dest: BlockId,
    },
    CondBr {
        cond: Operand,
        then_dest: BlockId,
        else_dest: BlockId,
    },
    Switch {
        cond: Operand,
        default_dest: BlockId,
        cases: Vec<(u128, BlockId)>,
    },
    IndirectBr {
        address: Operand,
        destinations: Vec<BlockId>,
    },
    Call {
        dest: Option<LocalId>,
        callee: Operand,
        args: Vec<Operand>,
        return_type: Type,
        sext_return: bool,
    },
    Phi {
        dest: LocalId,
        incoming: Vec<(BlockId, Operand)>,
    },
    Select {
        dest: LocalId,
        cond: Operand,
        then_value: Operand,
        else_value: Operand,
    },
    Alloca {
        dest: LocalId,
        element_type: Type,
        count: Operand,
        alignment: u64,
    },
    Load {
        dest: LocalId,
        address: Operand,
        ty: Type,
    },
    Store {
        address: Operand,
        value: Operand,
    },
    GetElementPtr {
        dest: LocalId,
        base: Operand,
        offset: u64,
        indices: Vec<(Operand, u64)>,
    },
    Cast {
        dest: LocalId,
        op: CastOp,
        value: Operand,
        ty: Type,
    },
    Binary {
        dest: LocalId,
        op: BinOp,
        lhs: Operand,
        rhs: Operand,
    },
    ICmp {
        dest: LocalId,
        pred: CmpPred,
        lhs: Operand,
        rhs: Operand,
    },
    FBinary {
        dest: LocalId,
        op: FloatOp,
        lhs: Operand,
        rhs: Operand,
        ty: Type,
    },
    FCmp {
        dest: LocalId,
        pred: FloatCmpPred,
        lhs: Operand,
        rhs: Operand,
        ty: Type,
    },
    FCast {
        dest: LocalId,
        op: FloatCastOp,
        value: Operand,
        from: Type,
        to: Type,
    },
    InsertElement {
        dest: LocalId,
        vector: Operand,
        element: Operand,
        index: Operand,
        element_width: Width,
        count: u64,
    },
    ExtractElement {
        dest: LocalId,
        vector: Operand,
        index: Operand,
        element_width: Width,
        count: u64,
    },
    VaArg {
        dest: LocalId,
        ty: Type,
    },
    Unreachable,
    AtomicRmw,
    AtomicCmpXchg,
    ShuffleVector,
}

impl Instruction {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instruction::Ret { .. }
                | Instruction::Br { .. }
                | Instruction::CondBr { .. }
                | Instruction::Switch { .. }
                | Instruction::IndirectBr { .. }
                | Instruction::Unreachable
        )
    }

    pub fn mnemonic(&self) -> &'static str {
        match self {
            Instruction::Ret { .. } => "ret",
            Instruction::Br { .. } => "br",
            Instruction::CondBr { .. } => "br.cond",
            Instruction::Switch { .. } => "switch",
            Instruction::IndirectBr { .. } => "indirectbr",
            Instruction::Call { .. } => "call",
            Instruction::Phi { .. } => "phi",
            Instruction::Select { .. } => "select",
            Instruction::Alloca { .. } => "alloca",
            Instruction::Load { .. } => "load",
            Instruction::Store { .. } => "store",
            Instruction::GetElementPtr { .. } => "getelementptr",
            Instruction::Cast { .. } => "cast",
            Instruction::Binary { .. } => "binop",
            Instruction::ICmp { .. } => "icmp",
            Instruction::FBinary { .. } => "fbinop",
            Instruction::FCmp { .. } => "fcmp",
            Instruction::FCast { .. } => "fcast",
            Instruction::InsertElement { .. } => "insertelement",
            Instruction::ExtractElement { .. } => "extractelement",
            Instruction::VaArg { .. } => "va_arg",
            Instruction::Unreachable => "unreachable",
            Instruction::AtomicRmw => "atomicrmw",
            Instruction::AtomicCmpXchg => "cmpxchg",
            Instruction::ShuffleVector => "shufflevector",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    pub instructions: Vec<Instruction>,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<Type>,
    pub return_type: Type,
    pub num_locals: usize,
    pub blocks: Vec<BasicBlock>,
    pub is_variadic: bool,
}

impl Function {
    /// Declarations have no body and are dispatched as external calls.
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Global {
    pub name: String,
    pub ty: Type,
    pub initializer: Option<Vec<u8>>,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Module {
    pub functions: Vec<Function>,
    pub globals: Vec<Global>,
}

impl Module {
    pub fn function(&self, id: FunctionId) -> &Function {
        &self.functions[id]
    }

    pub fn function_by_name(&self, name: &str) -> Option<FunctionId> {
        self.functions.iter().position(|f| f.name == name)
    }
}

/// A position in a function's instruction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodePtr {
    pub function: FunctionId,
    pub block: BlockId,
    pub index: usize,
}

impl CodePtr {
    pub fn entry(function: FunctionId) -> CodePtr {
        CodePtr {
            function,
            block: 0,
            index: 0,
        }
    }

    pub fn block_entry(function: FunctionId, block: BlockId) -> CodePtr {
        CodePtr {
            function,
            block,
            index: 0,
        }
    }

    pub fn next(&self) -> CodePtr {
        CodePtr {
            function: self.function,
            block: self.block,
            index: self.index + 1,
        }
    }
}

impl fmt::Display for CodePtr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "f{}:b{}:{}", self.function, self.block, self.index)
    }
}

/// Programmatic module construction, used by hosts and tests.
#[derive(Debug, Default)]
pub struct ModuleBuilder {
    module: Module,
    by_name: HashMap<String, FunctionId>,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(
        &mut self,
        name: impl Into<String>,
        params: Vec<Type>,
        return_type: Type,
        is_variadic: bool,
    ) -> FunctionId {
        let name = name.into();
        let id = self.module.functions.len();
        let num_locals = params.len();
        self.by_name.insert(name.clone(), id);
        self.module.functions.push(Function {
            name,
            params,
            return_type,
            num_locals,
            blocks: Vec::new(),
            is_variadic,
        });
        id
    }

    pub fn add_global(
        &mut self,
        name: impl Into<String>,
        ty: Type,
        initializer: Option<Vec<u8>>,
        read_only: bool,
    ) -> GlobalId {
        let id = self.module.globals.len();
        self.module.globals.push(Global {
            name: name.into(),
            ty,
            initializer,
            read_only,
        });
        id
    }

    pub fn function(&mut self, id: FunctionId) -> FunctionBuilder<'_> {
        FunctionBuilder {
            function: &mut self.module.functions[id],
        }
    }

    pub fn build(self) -> Module {
        self.module
    }
}

#[derive(Debug)]
pub struct FunctionBuilder<'a> {
    function: &'a mut Function,
}

impl<'a> FunctionBuilder<'a> {
    pub fn local(&mut self) -> LocalId {
        let id = self.function.num_locals;
        self.function.num_locals += 1;
        id
    }

    pub fn block(&mut self) -> BlockId {
        let id = self.function.blocks.len();
        self.function.blocks.push(BasicBlock::default());
        id
    }

    pub fn push(&mut self, block: BlockId, instruction: Instruction) {
        let block = &mut self.function.blocks[block];
        if let Some(last) = block.instructions.last() {
            assert!(
                !last.is_terminator(),
                "cannot append after a block terminator"
            );
        }
        block.instructions.push(instruction);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_assigns_dense_ids() {
        let mut builder = ModuleBuilder::new();
        let main = builder.declare("main", vec![], Type::Int(32), false);
        {
            let mut f = builder.function(main);
            let entry = f.block();
            let tmp = f.local();
            f.push(
                entry,
                Instruction::Binary {
                    dest: tmp,
                    op: crate::expr::BinOp::Add,
                    lhs: Operand::i32(1),
                    rhs: Operand::i32(2),
                },
            );
            f.push(entry, Instruction::Ret { value: None });
        }
        let module = builder.build();
        assert_eq!(module.function_by_name("main"), Some(main));
        assert_eq!(module.function(main).blocks.len(), 1);
        assert_eq!(module.function(main).num_locals, 1);
    }

    #[test]
    fn type_sizes() {
        assert_eq!(Type::Int(32).store_size(), 4);
        assert_eq!(Type::Pointer.store_size(), 8);
        assert_eq!(Type::Array(Box::new(Type::Int(16)), 3).store_size(), 6);
        assert_eq!(
            Type::Struct(vec![Type::Int(8), Type::Pointer]).store_size(),
            9
        );
        assert_eq!(Type::Vector(Box::new(Type::Int(32)), 4).width(), 128);
    }
}
