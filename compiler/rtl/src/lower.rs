/// Lowers the type-checked AST into RTL.
///
/// The lowering keeps a label cursor: `in_label` names the point where the
/// next instruction belongs. Lowering an int-valued expression leaves its
/// value in `result`; lowering a bool-valued expression leaves `in_label`
/// at the entry of the true branch and `false_label` at the entry of the
/// false branch, materializing a 0/1 value only on demand.

use std::collections::{HashMap, HashSet};

use amd64::Reg;
use ast::{ExprKind, Stmt, Type};

use crate::ir::*;

const ARG_REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

const CALLEE_SAVED: [Reg; 6] = [Reg::Rbx, Reg::Rbp, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

pub fn lower_program(program: &ast::Program) -> Result<Program, RtlError> {
    let globals = layout_globals(&program.globals)?;
    let global_names: HashSet<String> = globals.iter().map(|g| g.name.clone()).collect();

    let mut names = Names::default();
    let mut callables = vec![];

    for callable in &program.callables {
        callables.push(Lowerer::new(&mut names, &global_names, &callable.name).lower(callable)?);
    }

    Ok(Program { globals, callables })
}

/// Record initializers and assign data-section offsets, in source order.
fn layout_globals(globals: &[ast::GlobalVar]) -> Result<Vec<GlobalDef>, RtlError> {
    let mut defs = vec![];
    let mut offset = 0;

    for global in globals {
        let init = match &global.init.kind {
            ExprKind::IntConstant(value) => *value,
            ExprKind::BoolConstant(value) => *value as i64,
            ExprKind::Null => 0,
            _ => return Err(RtlError::NonConstantInitializer(global.name.clone())),
        };

        let size = ast::size_of(&global.ty);
        defs.push(GlobalDef {
            name: global.name.clone(),
            init,
            offset,
            size,
        });
        offset += size;
    }

    Ok(defs)
}

struct Lowerer<'a> {
    names: &'a mut Names,
    globals: &'a HashSet<String>,
    cbl: Callable,

    /// Where the next instruction will be installed; for bool expressions,
    /// the entry of the true branch after lowering
    in_label: Label,
    /// For bool expressions: the entry of the false branch
    false_label: Label,
    /// For int expressions: the pseudo holding the value
    result: Pseudo,
    /// For assignables: the pseudo holding the address
    address: Pseudo,

    /// Pseudo-backed variables
    var_table: HashMap<String, Pseudo>,
    /// Frame offsets of memory-backed variables (bytes below %rbp)
    var_offset: HashMap<String, i64>,
    /// Variables whose address is taken, plus all lists
    memory_backed: HashSet<String>,
    last_offset: i64,
}

impl<'a> Lowerer<'a> {
    fn new(names: &'a mut Names, globals: &'a HashSet<String>, name: &str) -> Self {
        let enter = names.fresh_label();
        let leave = names.fresh_label();

        Self {
            names,
            globals,
            cbl: Callable::new(name, enter, leave),
            in_label: enter,
            false_label: enter,
            result: DISCARD,
            address: DISCARD,
            var_table: HashMap::new(),
            var_offset: HashMap::new(),
            memory_backed: HashSet::new(),
            last_offset: 0,
        }
    }

    fn lower(mut self, source: &ast::Callable) -> Result<Callable, RtlError> {
        collect_address_taken_block(&source.body, &mut self.memory_backed);

        // Reserve the prologue slot; its NewFrame size is known only after
        // the whole body has been lowered.
        let prologue_slot = self.in_label;
        let frame_entry = self.names.fresh_label();
        self.in_label = frame_entry;

        // Save the callee-saved registers
        let mut saved = vec![];
        for reg in CALLEE_SAVED {
            let dest = self.names.fresh_pseudo();
            saved.push(dest);
            self.add_sequential(|next| Instr::CopyMp {
                src: reg,
                dest,
                succ: next,
            })?;
        }

        // Retrieve the arguments
        for (name, _) in &source.params {
            let pseudo = self.get_pseudo(name);
            self.cbl.input_regs.push(pseudo);
        }

        let nparams = source.params.len();
        for i in 0..nparams.min(6) {
            let dest = self.cbl.input_regs[i];
            self.add_sequential(|next| Instr::CopyMp {
                src: ARG_REGS[i],
                dest,
                succ: next,
            })?;
        }
        for i in 6..nparams {
            let dest = self.cbl.input_regs[i];
            let slot = i - 5;
            self.add_sequential(|next| Instr::LoadParam {
                slot,
                dest,
                succ: next,
            })?;
        }

        // Address-taken parameters live in the frame; spill them there
        for (i, (name, ty)) in source.params.iter().enumerate() {
            if self.memory_backed.contains(name) {
                let home = self.assign_home(name, ast::size_of(ty));
                let src = self.cbl.input_regs[i];
                self.store_to_frame(src, home)?;
            }
        }

        if source.return_ty.is_some() {
            self.cbl.output_reg = self.names.fresh_pseudo();
        }

        for stmt in &source.body.stmts {
            self.stmt(stmt)?;
        }

        // Fall-through result for functions whose body ends without `return`
        if self.cbl.output_reg != DISCARD {
            let src = self.cbl.output_reg;
            self.add_sequential(|next| Instr::CopyPm {
                src,
                dest: Reg::Rax,
                succ: next,
            })?;
        }

        // Splice the leave label into the linear stream
        let leave = self.cbl.leave;
        let epilogue = self.in_label;
        self.cbl.add_instr(leave, Instr::Goto { succ: epilogue })?;

        // Restore the callee-saved registers
        for (i, reg) in CALLEE_SAVED.iter().enumerate() {
            let src = saved[i];
            let dest = *reg;
            self.add_sequential(|next| Instr::CopyPm {
                src,
                dest,
                succ: next,
            })?;
        }

        // Back-patch the reserved prologue slot with the final frame size
        let size = self.last_offset;
        self.cbl.add_instr(
            prologue_slot,
            Instr::NewFrame {
                size,
                succ: frame_entry,
            },
        )?;

        self.add_sequential(|next| Instr::DelFrame { succ: next })?;
        let last = self.in_label;
        self.cbl.add_instr(last, Instr::Return)?;

        Ok(self.cbl)
    }

    /// Install an instruction at `in_label` targeting a fresh label, and
    /// move the cursor there.
    fn add_sequential<F>(&mut self, make: F) -> Result<(), RtlError>
    where
        F: FnOnce(Label) -> Instr,
    {
        let next = self.names.fresh_label();
        let instr = make(next);
        self.cbl.add_instr(self.in_label, instr)?;
        self.in_label = next;
        Ok(())
    }

    fn get_pseudo(&mut self, name: &str) -> Pseudo {
        if let Some(&pseudo) = self.var_table.get(name) {
            return pseudo;
        }

        let pseudo = self.names.fresh_pseudo();
        self.var_table.insert(name.to_string(), pseudo);
        pseudo
    }

    /// Frame home of a memory-backed variable: `size` bytes ending at
    /// `-offset(%rbp)`, elements ascending from the base.
    fn assign_home(&mut self, name: &str, size: i64) -> i64 {
        if let Some(&offset) = self.var_offset.get(name) {
            return offset;
        }

        self.last_offset += size;
        let offset = self.last_offset;
        self.var_offset.insert(name.to_string(), offset);
        offset
    }

    /// Force the bool result into an int64 result
    fn intify(&mut self) -> Result<(), RtlError> {
        let dest = self.names.fresh_pseudo();
        let next = self.names.fresh_label();

        self.cbl.add_instr(
            self.in_label,
            Instr::Move {
                source: 1,
                dest,
                succ: next,
            },
        )?;
        self.cbl.add_instr(
            self.false_label,
            Instr::Move {
                source: 0,
                dest,
                succ: next,
            },
        )?;

        self.in_label = next;
        self.result = dest;

        Ok(())
    }

    /// Get a fresh copy of the result to avoid clobbering it
    fn copy_of_result(&mut self) -> Result<Pseudo, RtlError> {
        let src = self.result;
        let dest = self.names.fresh_pseudo();
        self.add_sequential(|next| Instr::Copy {
            src,
            dest,
            succ: next,
        })?;
        Ok(dest)
    }

    /// Turn the int64 in `result` into short-circuit form by testing it
    /// against zero.
    fn branch_bool(&mut self) -> Result<(), RtlError> {
        let arg = self.result;
        let fail = self.names.fresh_label();
        self.false_label = fail;
        self.add_sequential(|next| Instr::Ubranch {
            op: UbranchCode::Jnz,
            arg,
            succ: next,
            fail,
        })
    }

    fn expr(&mut self, e: &ast::Expr) -> Result<(), RtlError> {
        match &e.kind {
            ExprKind::IntConstant(value) => {
                let dest = self.names.fresh_pseudo();
                let source = *value;
                self.result = dest;
                self.add_sequential(|next| Instr::Move {
                    source,
                    dest,
                    succ: next,
                })
            }
            ExprKind::BoolConstant(true) => {
                // in_label is already the true branch; the false branch
                // stays unreachable unless something is written to it
                self.false_label = self.names.fresh_label();
                Ok(())
            }
            ExprKind::BoolConstant(false) => {
                self.false_label = self.in_label;
                self.in_label = self.names.fresh_label();
                Ok(())
            }
            ExprKind::Null => {
                let dest = self.names.fresh_pseudo();
                self.result = dest;
                self.add_sequential(|next| Instr::Move {
                    source: 0,
                    dest,
                    succ: next,
                })
            }
            ExprKind::Var(name) => {
                if self.globals.contains(name) {
                    let symbol = name.clone();
                    let dest = self.names.fresh_pseudo();
                    self.result = dest;
                    self.add_sequential(|next| Instr::Load {
                        addr: MemRef::Global { symbol, offset: 0 },
                        dest,
                        succ: next,
                    })?;
                } else if self.memory_backed.contains(name) {
                    let home = self.var_offset[name];
                    let dest = self.load_from_frame(home)?;
                    self.result = dest;
                } else {
                    self.result = self.get_pseudo(name);
                }

                if e.ty == Type::Bool {
                    self.branch_bool()?;
                }
                Ok(())
            }
            ExprKind::Unary { op, arg } => match op {
                ast::UnaryOp::Negate | ast::UnaryOp::BitNot => {
                    self.expr(arg)?;
                    let dest = self.copy_of_result()?;
                    let code = if *op == ast::UnaryOp::Negate {
                        UnopCode::Neg
                    } else {
                        UnopCode::Not
                    };
                    self.result = dest;
                    self.add_sequential(|next| Instr::Unop {
                        op: code,
                        arg: dest,
                        succ: next,
                    })
                }
                ast::UnaryOp::LogNot => {
                    self.expr(arg)?;
                    std::mem::swap(&mut self.in_label, &mut self.false_label);
                    Ok(())
                }
            },
            ExprKind::Binary { op, left, right } => self.binary(*op, left, right),
            ExprKind::Call { func, args } => self.call(func, args, &e.ty),
            ExprKind::Alloc { elem_ty, len } => self.alloc(elem_ty, len),
            ExprKind::AddressOf(arg) => {
                self.addr_of(arg)?;
                self.result = self.address;
                Ok(())
            }
            ExprKind::Deref(ptr) => {
                self.expr(ptr)?;
                let base = self.result;
                let dest = self.names.fresh_pseudo();
                self.result = dest;
                self.add_sequential(|next| Instr::Load {
                    addr: MemRef::Reg { base, offset: 0 },
                    dest,
                    succ: next,
                })?;
                if e.ty == Type::Bool {
                    self.branch_bool()?;
                }
                Ok(())
            }
            ExprKind::ListElem { list, index } => {
                self.elem_addr(list, index)?;
                let base = self.address;
                let dest = self.names.fresh_pseudo();
                self.result = dest;
                self.add_sequential(|next| Instr::Load {
                    addr: MemRef::Reg { base, offset: 0 },
                    dest,
                    succ: next,
                })?;
                if e.ty == Type::Bool {
                    self.branch_bool()?;
                }
                Ok(())
            }
        }
    }

    fn binary(
        &mut self,
        op: ast::BinaryOp,
        left: &ast::Expr,
        right: &ast::Expr,
    ) -> Result<(), RtlError> {
        use ast::BinaryOp::*;

        match op {
            Add | Subtract | Multiply | Divide | Modulo | BitAnd | BitOr | BitXor | Lshift
            | Rshift => {
                let code = int_binop(op);
                self.expr(left)?;
                let dest = self.copy_of_result()?;
                self.expr(right)?;
                let src = self.result;
                self.result = dest;
                self.add_sequential(|next| Instr::Binop {
                    op: code,
                    src,
                    dest,
                    succ: next,
                })
            }
            Less | LessEq | Greater | GreaterEq => {
                let code = match op {
                    Less => BbranchCode::Jl,
                    LessEq => BbranchCode::Jle,
                    Greater => BbranchCode::Jg,
                    _ => BbranchCode::Jge,
                };

                self.expr(left)?;
                let arg1 = self.result;
                self.expr(right)?;
                let arg2 = self.result;

                let fail = self.names.fresh_label();
                self.false_label = fail;
                self.add_sequential(|next| Instr::Bbranch {
                    op: code,
                    arg1,
                    arg2,
                    succ: next,
                    fail,
                })
            }
            Eq | NotEq => {
                self.expr(left)?;
                if left.ty == Type::Bool {
                    self.intify()?;
                }
                let arg1 = self.result;

                self.expr(right)?;
                if right.ty == Type::Bool {
                    self.intify()?;
                }
                let arg2 = self.result;

                let code = if op == Eq {
                    BbranchCode::Je
                } else {
                    BbranchCode::Jne
                };

                let fail = self.names.fresh_label();
                self.false_label = fail;
                self.add_sequential(|next| Instr::Bbranch {
                    op: code,
                    arg1,
                    arg2,
                    succ: next,
                    fail,
                })
            }
            LogAnd => {
                self.expr(left)?;
                let left_true = self.in_label;
                let left_false = self.false_label;

                // the right operand is evaluated only when the left is true
                self.in_label = left_true;
                self.expr(right)?;
                let right_true = self.in_label;
                let right_false = self.false_label;

                self.cbl
                    .add_instr(right_false, Instr::Goto { succ: left_false })?;
                self.in_label = right_true;
                self.false_label = left_false;
                Ok(())
            }
            LogOr => {
                self.expr(left)?;
                let left_true = self.in_label;
                let left_false = self.false_label;

                // the right operand is evaluated only when the left is false
                self.in_label = left_false;
                self.expr(right)?;
                let right_true = self.in_label;
                let right_false = self.false_label;

                self.cbl
                    .add_instr(right_true, Instr::Goto { succ: left_true })?;
                self.in_label = left_true;
                self.false_label = right_false;
                Ok(())
            }
        }
    }

    fn call(&mut self, func: &str, args: &[ast::Expr], result_ty: &Type) -> Result<(), RtlError> {
        let mut arg_values = vec![];
        for arg in args {
            self.expr(arg)?;
            if arg.ty == Type::Bool {
                self.intify()?;
            }
            arg_values.push(self.result);
        }

        let nargs = arg_values.len();
        for i in 0..nargs.min(6) {
            let src = arg_values[i];
            self.add_sequential(|next| Instr::CopyPm {
                src,
                dest: ARG_REGS[i],
                succ: next,
            })?;
        }

        if nargs > 6 {
            // keep the stack-argument block 16-byte aligned
            if (nargs - 6) % 2 == 1 {
                let src = arg_values[nargs - 1];
                self.add_sequential(|next| Instr::Push { src, succ: next })?;
            }
            for i in (6..nargs).rev() {
                let src = arg_values[i];
                self.add_sequential(|next| Instr::Push { src, succ: next })?;
            }
        }

        let func = func.to_string();
        self.add_sequential(|next| Instr::Call {
            func,
            nargs,
            succ: next,
        })?;

        if *result_ty == Type::Unknown {
            // procedure call in statement position
            self.result = DISCARD;
            return Ok(());
        }

        let dest = self.names.fresh_pseudo();
        self.result = dest;
        self.add_sequential(|next| Instr::CopyMp {
            src: Reg::Rax,
            dest,
            succ: next,
        })?;

        if *result_ty == Type::Bool {
            self.branch_bool()?;
        }

        Ok(())
    }

    fn alloc(&mut self, elem_ty: &Type, len: &ast::Expr) -> Result<(), RtlError> {
        let scale = self.names.fresh_pseudo();
        let elem_size = ast::size_of(elem_ty);
        self.add_sequential(|next| Instr::Move {
            source: elem_size,
            dest: scale,
            succ: next,
        })?;

        self.expr(len)?;
        let total = self.copy_of_result()?;
        self.add_sequential(|next| Instr::Binop {
            op: BinopCode::Mul,
            src: scale,
            dest: total,
            succ: next,
        })?;

        self.add_sequential(|next| Instr::CopyPm {
            src: total,
            dest: Reg::Rdi,
            succ: next,
        })?;
        self.add_sequential(|next| Instr::Call {
            func: "malloc".to_string(),
            nargs: 1,
            succ: next,
        })?;

        let dest = self.names.fresh_pseudo();
        self.result = dest;
        self.add_sequential(|next| Instr::CopyMp {
            src: Reg::Rax,
            dest,
            succ: next,
        })
    }

    /// Compute the address of an assignable expression into `address`.
    fn addr_of(&mut self, e: &ast::Expr) -> Result<(), RtlError> {
        match &e.kind {
            ExprKind::Var(name) => {
                let dest = self.names.fresh_pseudo();
                let addr = if self.globals.contains(name) {
                    Addr::Global(name.clone())
                } else {
                    let home = self.var_offset[name];
                    Addr::Frame(-home)
                };

                self.address = dest;
                self.add_sequential(|next| Instr::CopyAp {
                    addr,
                    dest,
                    succ: next,
                })
            }
            ExprKind::ListElem { list, index } => self.elem_addr(list, index),
            ExprKind::Deref(ptr) => {
                self.expr(ptr)?;
                self.address = self.result;
                Ok(())
            }
            kind => unreachable!("address of a non-assignable expression: {:?}", kind),
        }
    }

    /// Address of `list[index]`: element `index` lives at
    /// `base + index * size_of(element)`.
    fn elem_addr(&mut self, list: &ast::Expr, index: &ast::Expr) -> Result<(), RtlError> {
        // a pointer holds the base address as its value; a list is its storage
        let base = if list.ty.is_pointer() {
            self.expr(list)?;
            self.result
        } else {
            self.addr_of(list)?;
            self.address
        };

        let elem_size = match &list.ty {
            Type::Pointer(to) => ast::size_of(to),
            Type::List(elem, _) => ast::size_of(elem),
            ty => unreachable!("indexing a value of type {}", ty),
        };

        self.expr(index)?;
        let offset = self.copy_of_result()?;

        let scale = self.names.fresh_pseudo();
        self.add_sequential(|next| Instr::Move {
            source: elem_size,
            dest: scale,
            succ: next,
        })?;
        self.add_sequential(|next| Instr::Binop {
            op: BinopCode::Mul,
            src: scale,
            dest: offset,
            succ: next,
        })?;
        self.add_sequential(|next| Instr::Binop {
            op: BinopCode::Add,
            src: base,
            dest: offset,
            succ: next,
        })?;

        self.address = offset;
        Ok(())
    }

    fn load_from_frame(&mut self, home: i64) -> Result<Pseudo, RtlError> {
        let base = self.names.fresh_pseudo();
        self.add_sequential(|next| Instr::CopyAp {
            addr: Addr::Frame(-home),
            dest: base,
            succ: next,
        })?;

        let dest = self.names.fresh_pseudo();
        self.add_sequential(|next| Instr::Load {
            addr: MemRef::Reg { base, offset: 0 },
            dest,
            succ: next,
        })?;

        Ok(dest)
    }

    fn store_to_frame(&mut self, src: Pseudo, home: i64) -> Result<(), RtlError> {
        let base = self.names.fresh_pseudo();
        self.add_sequential(|next| Instr::CopyAp {
            addr: Addr::Frame(-home),
            dest: base,
            succ: next,
        })?;
        self.add_sequential(|next| Instr::Store {
            src,
            addr: MemRef::Reg { base, offset: 0 },
            succ: next,
        })
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), RtlError> {
        match stmt {
            Stmt::Declare { name, ty, init } => self.declare(name, ty, init),
            Stmt::Assign { target, value } => self.assign(target, value),
            Stmt::Eval(e) => {
                self.expr(e)?;
                if e.ty == Type::Bool {
                    self.intify()?;
                }
                Ok(())
            }
            Stmt::Print(e) => {
                self.expr(e)?;
                if e.ty == Type::Bool {
                    self.intify()?;
                }

                let func = if e.ty == Type::Bool {
                    "bx_print_bool"
                } else {
                    "bx_print_int"
                };

                let src = self.result;
                self.add_sequential(|next| Instr::CopyPm {
                    src,
                    dest: Reg::Rdi,
                    succ: next,
                })?;
                self.add_sequential(|next| Instr::Call {
                    func: func.to_string(),
                    nargs: 1,
                    succ: next,
                })
            }
            Stmt::Block(block) => {
                for stmt in &block.stmts {
                    self.stmt(stmt)?;
                }
                Ok(())
            }
            Stmt::IfElse {
                condition,
                true_branch,
                false_branch,
            } => {
                self.expr(condition)?;
                let then_label = self.in_label;
                let else_label = self.false_label;
                let join = self.names.fresh_label();

                self.in_label = then_label;
                self.stmt(true_branch)?;
                let then_end = self.in_label;
                self.cbl.add_instr(then_end, Instr::Goto { succ: join })?;

                self.in_label = else_label;
                if let Some(false_branch) = false_branch {
                    self.stmt(false_branch)?;
                }
                let else_end = self.in_label;
                self.cbl.add_instr(else_end, Instr::Goto { succ: join })?;

                self.in_label = join;
                Ok(())
            }
            Stmt::While { condition, body } => {
                let loop_head = self.in_label;
                self.expr(condition)?;
                let exit = self.false_label;

                self.stmt(body)?;
                let body_end = self.in_label;
                self.cbl.add_instr(body_end, Instr::Goto { succ: loop_head })?;

                self.in_label = exit;
                Ok(())
            }
            Stmt::Return(None) => {
                let leave = self.cbl.leave;
                self.add_sequential(|_| Instr::Goto { succ: leave })
            }
            Stmt::Return(Some(e)) => {
                self.expr(e)?;
                if e.ty == Type::Bool {
                    self.intify()?;
                }

                if self.cbl.output_reg != DISCARD {
                    let src = self.result;
                    let out = self.cbl.output_reg;
                    self.add_sequential(|next| Instr::Copy {
                        src,
                        dest: out,
                        succ: next,
                    })?;
                    self.add_sequential(|next| Instr::CopyPm {
                        src: out,
                        dest: Reg::Rax,
                        succ: next,
                    })?;
                }

                let leave = self.cbl.leave;
                self.add_sequential(|_| Instr::Goto { succ: leave })
            }
        }
    }

    fn declare(&mut self, name: &str, ty: &Type, init: &ast::Expr) -> Result<(), RtlError> {
        if matches!(ty, Type::List(..)) {
            // list storage lives in the frame and starts zeroed
            let size = ast::size_of(ty);
            self.memory_backed.insert(name.to_string());
            let home = self.assign_home(name, size);
            return self.zero_frame_range(home, size);
        }

        if self.memory_backed.contains(name) {
            let home = self.assign_home(name, ast::size_of(ty));
            self.expr(init)?;
            if init.ty == Type::Bool {
                self.intify()?;
            }
            let src = self.result;
            self.store_to_frame(src, home)
        } else {
            let dest = self.get_pseudo(name);
            self.expr(init)?;
            if init.ty == Type::Bool {
                self.intify()?;
            }
            let src = self.result;
            self.add_sequential(|next| Instr::Copy {
                src,
                dest,
                succ: next,
            })
        }
    }

    /// `memset(base, 0, size)` over a frame range
    fn zero_frame_range(&mut self, home: i64, size: i64) -> Result<(), RtlError> {
        let base = self.names.fresh_pseudo();
        self.add_sequential(|next| Instr::CopyAp {
            addr: Addr::Frame(-home),
            dest: base,
            succ: next,
        })?;

        let fill = self.names.fresh_pseudo();
        self.add_sequential(|next| Instr::Move {
            source: 0,
            dest: fill,
            succ: next,
        })?;
        let len = self.names.fresh_pseudo();
        self.add_sequential(|next| Instr::Move {
            source: size,
            dest: len,
            succ: next,
        })?;

        self.add_sequential(|next| Instr::CopyPm {
            src: base,
            dest: Reg::Rdi,
            succ: next,
        })?;
        self.add_sequential(|next| Instr::CopyPm {
            src: fill,
            dest: Reg::Rsi,
            succ: next,
        })?;
        self.add_sequential(|next| Instr::CopyPm {
            src: len,
            dest: Reg::Rdx,
            succ: next,
        })?;
        self.add_sequential(|next| Instr::Call {
            func: "memset".to_string(),
            nargs: 3,
            succ: next,
        })
    }

    fn assign(&mut self, target: &ast::Expr, value: &ast::Expr) -> Result<(), RtlError> {
        if let ExprKind::Var(name) = &target.kind {
            // globals store straight through their symbol
            if self.globals.contains(name) {
                let symbol = name.clone();
                self.expr(value)?;
                if value.ty == Type::Bool {
                    self.intify()?;
                }
                let src = self.result;
                return self.add_sequential(|next| Instr::Store {
                    src,
                    addr: MemRef::Global { symbol, offset: 0 },
                    succ: next,
                });
            }

            // plain pseudo-backed variables assign with a register copy
            if !self.memory_backed.contains(name) {
                let dest = self.get_pseudo(name);
                self.expr(value)?;
                if value.ty == Type::Bool {
                    self.intify()?;
                }
                let src = self.result;
                return self.add_sequential(|next| Instr::Copy {
                    src,
                    dest,
                    succ: next,
                });
            }
        }

        self.addr_of(target)?;
        let base = self.address;

        self.expr(value)?;
        if value.ty == Type::Bool {
            self.intify()?;
        }
        let src = self.result;

        self.add_sequential(|next| Instr::Store {
            src,
            addr: MemRef::Reg { base, offset: 0 },
            succ: next,
        })
    }
}

fn int_binop(op: ast::BinaryOp) -> BinopCode {
    use ast::BinaryOp::*;

    match op {
        Add => BinopCode::Add,
        Subtract => BinopCode::Sub,
        Multiply => BinopCode::Mul,
        Divide => BinopCode::Div,
        Modulo => BinopCode::Rem,
        BitAnd => BinopCode::And,
        BitOr => BinopCode::Or,
        BitXor => BinopCode::Xor,
        Lshift => BinopCode::Sal,
        Rshift => BinopCode::Sar,
        op => unreachable!("{:?} is not an int64 operator", op),
    }
}

fn collect_address_taken_block(block: &ast::Block, out: &mut HashSet<String>) {
    for stmt in &block.stmts {
        collect_address_taken_stmt(stmt, out);
    }
}

fn collect_address_taken_stmt(stmt: &Stmt, out: &mut HashSet<String>) {
    match stmt {
        Stmt::Declare { init, .. } => collect_address_taken_expr(init, out),
        Stmt::Assign { target, value } => {
            collect_address_taken_expr(target, out);
            collect_address_taken_expr(value, out);
        }
        Stmt::Eval(e) | Stmt::Print(e) => collect_address_taken_expr(e, out),
        Stmt::Block(block) => collect_address_taken_block(block, out),
        Stmt::IfElse {
            condition,
            true_branch,
            false_branch,
        } => {
            collect_address_taken_expr(condition, out);
            collect_address_taken_stmt(true_branch, out);
            if let Some(false_branch) = false_branch {
                collect_address_taken_stmt(false_branch, out);
            }
        }
        Stmt::While { condition, body } => {
            collect_address_taken_expr(condition, out);
            collect_address_taken_stmt(body, out);
        }
        Stmt::Return(None) => {}
        Stmt::Return(Some(e)) => collect_address_taken_expr(e, out),
    }
}

fn collect_address_taken_expr(expr: &ast::Expr, out: &mut HashSet<String>) {
    match &expr.kind {
        ExprKind::AddressOf(arg) => {
            if let ExprKind::Var(name) = &arg.kind {
                out.insert(name.clone());
            }
            collect_address_taken_expr(arg, out);
        }
        ExprKind::IntConstant(_)
        | ExprKind::BoolConstant(_)
        | ExprKind::Null
        | ExprKind::Var(_) => {}
        ExprKind::Unary { arg, .. } | ExprKind::Deref(arg) => {
            collect_address_taken_expr(arg, out)
        }
        ExprKind::Binary { left, right, .. } => {
            collect_address_taken_expr(left, out);
            collect_address_taken_expr(right, out);
        }
        ExprKind::Call { args, .. } => {
            for arg in args {
                collect_address_taken_expr(arg, out);
            }
        }
        ExprKind::Alloc { len, .. } => collect_address_taken_expr(len, out),
        ExprKind::ListElem { list, index } => {
            collect_address_taken_expr(list, out);
            collect_address_taken_expr(index, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn lower_src(src: &str) -> Program {
        let tokens = lexer::Lexer::new(src).tokenize();
        let mut program = parser::Parser::new(tokens).parse().unwrap();
        typecheck::check(&mut program).unwrap();
        lower_program(&program).unwrap()
    }

    fn find<'a>(program: &'a Program, name: &str) -> &'a Callable {
        program
            .callables
            .iter()
            .find(|c| c.name == name)
            .unwrap_or_else(|| panic!("no callable named {}", name))
    }

    /// Labels reachable from `start` by following successor edges
    fn reachable(callable: &Callable, start: Label) -> HashSet<Label> {
        let mut seen = HashSet::new();
        let mut work = vec![start];

        while let Some(label) = work.pop() {
            if !seen.insert(label) {
                continue;
            }
            if let Some(instr) = callable.body.get(&label) {
                work.extend(instr.successors());
            }
        }

        seen
    }

    #[test]
    fn cfg_is_closed_and_schedule_is_a_permutation() {
        let program = lower_src(
            "fun f(x : int64) : int64 { return x * x; }
             proc main() {
                 var x = 5 : int64;
                 while (x > 0) {
                     if (x == 3) print f(x); else print x;
                     x = x - 1;
                 }
             }",
        );

        for callable in &program.callables {
            // schedule is a permutation of the body keys
            assert_eq!(callable.schedule.len(), callable.body.len());
            let scheduled: HashSet<Label> = callable.schedule.iter().copied().collect();
            assert_eq!(scheduled.len(), callable.schedule.len());
            assert_eq!(scheduled, callable.body.keys().copied().collect());

            // every successor exists in the body
            for instr in callable.body.values() {
                for succ in instr.successors() {
                    assert!(callable.body.contains_key(&succ), "dangling label {}", succ);
                }
            }

            // enter and leave are installed; leave reaches Return
            assert!(callable.body.contains_key(&callable.enter));
            assert!(callable.body.contains_key(&callable.leave));
            let from_leave = reachable(callable, callable.leave);
            assert!(from_leave
                .iter()
                .any(|l| matches!(callable.body[l], Instr::Return)));
        }
    }

    #[test]
    fn short_circuit_or_guards_the_second_call() {
        let program = lower_src(
            "fun f() : bool { return true; }
             fun g() : bool { return true; }
             proc main() { if (f() || g()) print 1; }",
        );

        let main = find(&program, "main");

        // the branch on f's result
        let f_call = main
            .schedule
            .iter()
            .find(|l| matches!(&main.body[l], Instr::Call { func, .. } if func == "f"))
            .unwrap();

        // follow the straight-line chain from the call to the test on its result
        let mut label = *f_call;
        let (on_true, on_false) = loop {
            match &main.body[&label] {
                Instr::Ubranch { succ, fail, .. } => break (*succ, *fail),
                instr => label = instr.successors()[0],
            }
        };
        let calls_g = |labels: &HashSet<Label>| {
            labels
                .iter()
                .any(|l| matches!(&main.body[l], Instr::Call { func, .. } if func == "g"))
        };

        assert!(calls_g(&reachable(main, on_false)), "g unreachable when f is false");
        assert!(!calls_g(&reachable(main, on_true)), "g reached although f was true");
    }

    #[test]
    fn arity_eight_uses_stack_parameter_slots() {
        let program = lower_src(
            "fun f(a, b, c, d, e, x, y, z : int64) : int64 { return a + z; }
             proc main() { print f(1, 2, 3, 4, 5, 6, 7, 8); }",
        );

        let f = find(&program, "f");
        let slots: Vec<usize> = f
            .schedule
            .iter()
            .filter_map(|l| match f.body[l] {
                Instr::LoadParam { slot, .. } => Some(slot),
                _ => None,
            })
            .collect();
        assert_eq!(slots, vec![1, 2]);

        let main = find(&program, "main");
        let pushes = main
            .body
            .values()
            .filter(|i| matches!(i, Instr::Push { .. }))
            .count();
        assert_eq!(pushes, 2);
        assert!(main
            .body
            .values()
            .any(|i| matches!(i, Instr::Call { func, nargs: 8, .. } if func == "f")));
    }

    #[test]
    fn while_loop_has_a_back_edge() {
        let program = lower_src(
            "proc main() { var x = 5 : int64; while (x > 0) { print x; x = x - 1; } }",
        );

        let main = find(&program, "main");
        let index: std::collections::HashMap<Label, usize> = main
            .schedule
            .iter()
            .enumerate()
            .map(|(i, l)| (*l, i))
            .collect();

        let has_back_edge = main.schedule.iter().enumerate().any(|(i, l)| {
            matches!(&main.body[l], Instr::Goto { succ } if index[succ] < i)
        });
        assert!(has_back_edge, "loop lowering produced no back edge");
    }

    #[test]
    fn non_constant_global_initializer_is_rejected() {
        let src = "var g = 1 + 2 : int64; proc main() { print g; }";
        let tokens = lexer::Lexer::new(src).tokenize();
        let mut program = parser::Parser::new(tokens).parse().unwrap();
        typecheck::check(&mut program).unwrap();

        assert_eq!(
            lower_program(&program).unwrap_err(),
            RtlError::NonConstantInitializer("g".to_string())
        );
    }

    #[test]
    fn global_layout_assigns_monotonic_offsets() {
        let program = lower_src(
            "var a = 7 : int64;
             var b = true : bool;
             proc main() { print a; }",
        );

        assert_eq!(program.globals.len(), 2);
        assert_eq!((program.globals[0].offset, program.globals[0].size), (0, 8));
        assert_eq!((program.globals[1].offset, program.globals[1].size), (8, 8));
        assert_eq!(program.globals[1].init, 1);
    }

    #[test]
    fn address_taken_locals_are_memory_backed() {
        let program = lower_src(
            "proc main() {
                 var x = 3 : int64;
                 var p = &x : int64*;
                 *p = *p + 4;
                 print x;
             }",
        );

        let main = find(&program, "main");

        // x is written through its frame address and read back with a load
        assert!(main
            .body
            .values()
            .any(|i| matches!(i, Instr::CopyAp { addr: Addr::Frame(o), .. } if *o < 0)));
        assert!(main
            .body
            .values()
            .any(|i| matches!(i, Instr::Store { .. })));
        assert!(main.body.values().any(|i| matches!(i, Instr::Load { .. })));

        // frame storage was reserved for x
        let size = main
            .body
            .values()
            .find_map(|i| match i {
                Instr::NewFrame { size, .. } => Some(*size),
                _ => None,
            })
            .expect("no NewFrame marker");
        assert_eq!(size, 8);
    }

    #[test]
    fn list_declarations_are_zeroed_with_memset() {
        let program = lower_src(
            "proc main() { var a = 0 : int64[4]; a[0] = 1; print a[0]; }",
        );

        let main = find(&program, "main");
        assert!(main
            .body
            .values()
            .any(|i| matches!(i, Instr::Call { func, nargs: 3, .. } if func == "memset")));

        let size = main
            .body
            .values()
            .find_map(|i| match i {
                Instr::NewFrame { size, .. } => Some(*size),
                _ => None,
            })
            .unwrap();
        assert_eq!(size, 32);
    }

    #[test]
    fn bool_parameters_print_through_bx_print_bool() {
        let program = lower_src(
            "proc show(b : bool) { print b; }
             proc main() { show(true); }",
        );

        let show = find(&program, "show");
        assert!(show
            .body
            .values()
            .any(|i| matches!(i, Instr::Call { func, .. } if func == "bx_print_bool")));
    }
}
