//! Predicate evaluation over plan trees.
//!
//! Evaluation is three-valued (TRUE, FALSE, UNKNOWN) with an explicit
//! ERROR state; Boolean connectives short-circuit. A recursion depth
//! counter guards against pathological trees. Single-term predicates get
//! specialized entry points installed at plan-restore time; everything
//! else goes through the general recursive evaluator.

pub mod like;

use std::cell::RefCell;
use std::collections::HashMap;

use thiserror::Error;

use crate::plan::{
    AlsmTerm, BoolOp, CompTerm, EvalTerm, FuncType, LikeTerm, PlanArena, PredExpr, PredId, QlFlag,
    ReguId, ReguListId, ReguValue, RelOp, RlikeTerm, SrListId, XaslId, XaslStatus,
};
use crate::types::Oid;
use crate::value::{tp_value_compare, CmpResult, DbValue};

/// Result of a predicate evaluation.
///
/// The discriminants are wire- and log-visible; do not renumber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum DbLogical {
    Error = -1,
    False = 0,
    True = 1,
    Unknown = 2,
}

impl DbLogical {
    /// NOT over the four states: TRUE and FALSE flip, UNKNOWN and ERROR
    /// pass through.
    pub fn negate(self) -> DbLogical {
        match self {
            DbLogical::True => DbLogical::False,
            DbLogical::False => DbLogical::True,
            other => other,
        }
    }
}

/// Why an evaluation reported `DbLogical::Error`.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum EvalError {
    #[error("values are not comparable")]
    NotComparable,
    #[error("predicate tree exceeds the recursion depth bound of {0}")]
    MaxRecursionDepth(u32),
    #[error("nested plan execution failed")]
    SubPlanFailure,
    #[error("malformed predicate: {0}")]
    BadPlan(&'static str),
    #[error("regular expression error: {0}")]
    Regex(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("arithmetic overflow")]
    Overflow,
}

/// Entry point type of a predicate evaluation function.
pub type PrEvalFn = fn(&mut EvalContext<'_>, PredId) -> DbLogical;

/// A materialized single-column list file.
#[derive(Default)]
pub struct ListFile {
    pub tuples: Vec<DbValue>,
    pub sorted: bool,
}

/// Runtime store of materialized list files, keyed by the plan's sorted
/// list handles.
#[derive(Default)]
pub struct ListStore {
    lists: HashMap<SrListId, ListFile>,
}

impl ListStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: SrListId, tuples: Vec<DbValue>) {
        self.lists.insert(
            id,
            ListFile {
                tuples,
                sorted: false,
            },
        );
    }

    pub fn contains(&self, id: SrListId) -> bool {
        self.lists.contains_key(&id)
    }

    pub fn get(&self, id: SrListId) -> Option<&ListFile> {
        self.lists.get(&id)
    }

    fn get_mut(&mut self, id: SrListId) -> Option<&mut ListFile> {
        self.lists.get_mut(&id)
    }
}

/// Executes a nested plan to materialize its list file.
pub trait PlanExecutor {
    fn execute(
        &self,
        arena: &PlanArena,
        xasl: XaslId,
        lists: &mut ListStore,
    ) -> Result<(), EvalError>;
}

/// One cached attribute value.
pub struct AttrVal {
    pub id: i32,
    pub value: RefCell<DbValue>,
}

/// Attribute access cache of a scan: attribute values loaded from the
/// heap (data filter) or bound from a decoded index key (key filter).
pub struct AttrCache {
    attrs: Vec<AttrVal>,
}

impl AttrCache {
    pub fn new(attr_ids: &[i32]) -> Self {
        Self {
            attrs: attr_ids
                .iter()
                .map(|&id| AttrVal {
                    id,
                    value: RefCell::new(DbValue::Null),
                })
                .collect(),
        }
    }

    pub fn get(&self, id: i32) -> Option<DbValue> {
        self.attrs
            .iter()
            .find(|a| a.id == id)
            .map(|a| a.value.borrow().clone())
    }

    pub fn set(&self, id: i32, value: DbValue) -> bool {
        match self.attrs.iter().find(|a| a.id == id) {
            Some(attr) => {
                *attr.value.borrow_mut() = value;
                true
            }
            None => false,
        }
    }

    /// Load the cached attributes from a heap record given as
    /// `(attr_id, value)` pairs; attributes absent from the record become
    /// NULL.
    pub fn read_record(&self, record: &[(i32, DbValue)]) {
        for attr in &self.attrs {
            let value = record
                .iter()
                .find(|(id, _)| *id == attr.id)
                .map(|(_, v)| v.clone())
                .unwrap_or(DbValue::Null);
            *attr.value.borrow_mut() = value;
        }
    }
}

/// Predicates of a scan filter.
pub struct ScanPred {
    pub regu_list: Option<ReguListId>,
    pub pred: Option<PredId>,
    pub eval_fn: Option<PrEvalFn>,
}

/// Index shape needed by key filters: the attribute id of each key column.
pub struct IndexRepr {
    pub atts: Vec<i32>,
}

/// A filter bundle: predicate, regu list, and attribute cache.
pub struct FilterInfo<'a> {
    pub scan_pred: ScanPred,
    pub attr_ids: Vec<i32>,
    pub attr_cache: &'a AttrCache,
    pub class_oid: Option<Oid>,
    /// Index information, present for key filters.
    pub index: Option<IndexRepr>,
}

/// Evaluation state threaded through one predicate evaluation.
pub struct EvalContext<'a> {
    pub arena: &'a PlanArena,
    /// Positional host variables.
    pub host_vars: &'a [DbValue],
    /// Identifier of the object under evaluation.
    pub oid: Option<Oid>,
    /// Current tuple for positional references.
    pub tuple: Option<&'a [DbValue]>,
    /// Attribute cache for attribute references.
    pub attr_cache: Option<&'a AttrCache>,
    pub lists: &'a mut ListStore,
    pub executor: Option<&'a dyn PlanExecutor>,
    pub max_depth: u32,
    depth: u32,
    pub last_error: Option<EvalError>,
}

impl<'a> EvalContext<'a> {
    pub fn new(arena: &'a PlanArena, lists: &'a mut ListStore) -> Self {
        Self {
            arena,
            host_vars: &[],
            oid: None,
            tuple: None,
            attr_cache: None,
            lists,
            executor: None,
            max_depth: crate::types::SysParams::default().max_sql_depth,
            depth: 0,
            last_error: None,
        }
    }

    fn error(&mut self, e: EvalError) -> DbLogical {
        self.last_error = Some(e);
        DbLogical::Error
    }

    // -----------------------------------------------------------------
    // Value fetch
    // -----------------------------------------------------------------

    /// Evaluate a regu-variable to its current value. Writes the value
    /// into the variable's fetch target when one is set. `None` means an
    /// error was recorded on the context.
    pub fn fetch_peek(&mut self, regu_id: ReguId) -> Option<DbValue> {
        let regu = self.arena.regu(regu_id);
        let fetched = match &regu.value {
            ReguValue::DbVal(v) | ReguValue::Constant(v) | ReguValue::OrderByNum(v) => {
                Some(self.arena.value_clone(*v))
            }
            ReguValue::InArith(a) | ReguValue::OutArith(a) => self.eval_arith(*a),
            ReguValue::Attr(descr) => match self.attr_cache.and_then(|c| c.get(descr.id)) {
                Some(v) => Some(v),
                None => {
                    self.error(EvalError::BadPlan("attribute outside the scan cache"));
                    None
                }
            },
            ReguValue::Position(pos) => match self
                .tuple
                .and_then(|t| t.get(pos.pos_no as usize))
            {
                Some(v) => Some(v.clone()),
                None => {
                    self.error(EvalError::BadPlan("tuple position out of range"));
                    None
                }
            },
            ReguValue::PosValue(idx) => match self.host_vars.get(*idx as usize) {
                Some(v) => Some(v.clone()),
                None => {
                    self.error(EvalError::BadPlan("host variable index out of range"));
                    None
                }
            },
            ReguValue::ListId(_) => {
                self.error(EvalError::BadPlan("list file fetched as a scalar"));
                None
            }
            ReguValue::Oid => Some(match self.oid {
                Some(oid) => DbValue::Oid(oid),
                None => DbValue::Null,
            }),
            ReguValue::Func(f) => self.eval_func(*f),
        };
        if let (Some(v), Some(target)) = (&fetched, self.arena.regu(regu_id).vfetch_to) {
            self.arena.set_value(target, v.clone());
        }
        fetched
    }

    /// Fetch every variable of a regu list, discarding the values but
    /// keeping the side effects on their fetch targets.
    pub fn fetch_val_list(&mut self, head: Option<ReguListId>) -> Option<()> {
        for regu in self.arena.regu_list_items(head) {
            self.fetch_peek(regu)?;
        }
        Some(())
    }

    fn eval_arith(&mut self, arith_id: crate::plan::ArithId) -> Option<DbValue> {
        use crate::plan::ArithOp;

        let (opcode, left, right, value_cell) = {
            let a = self.arena.arith(arith_id);
            (a.opcode, a.left, a.right, a.value)
        };

        let fetch_operand = |ctx: &mut Self, r: Option<ReguId>| -> Option<DbValue> {
            match r {
                Some(r) => ctx.fetch_peek(r),
                None => {
                    ctx.error(EvalError::BadPlan("missing arithmetic operand"));
                    None
                }
            }
        };

        let result = match opcode {
            ArithOp::UnMinus | ArithOp::Abs | ArithOp::IsNull => {
                let v = fetch_operand(self, left)?;
                match opcode {
                    ArithOp::IsNull => DbValue::Int(v.is_null() as i32),
                    _ if v.is_null() => DbValue::Null,
                    ArithOp::UnMinus => match v {
                        DbValue::Int(x) => DbValue::Int(-x),
                        DbValue::Bigint(x) => DbValue::Bigint(-x),
                        DbValue::Double(x) => DbValue::Double(-x),
                        _ => {
                            self.error(EvalError::NotComparable);
                            return None;
                        }
                    },
                    _ => match v {
                        DbValue::Int(x) => DbValue::Int(x.abs()),
                        DbValue::Bigint(x) => DbValue::Bigint(x.abs()),
                        DbValue::Double(x) => DbValue::Double(x.abs()),
                        _ => {
                            self.error(EvalError::NotComparable);
                            return None;
                        }
                    },
                }
            }
            ArithOp::IfNull => {
                let v = fetch_operand(self, left)?;
                if v.is_null() {
                    fetch_operand(self, right)?
                } else {
                    v
                }
            }
            _ => {
                let l = fetch_operand(self, left)?;
                let r = fetch_operand(self, right)?;
                if l.is_null() || r.is_null() {
                    DbValue::Null
                } else {
                    self.numeric_binop(opcode, &l, &r)?
                }
            }
        };

        self.arena.set_value(value_cell, result.clone());
        Some(result)
    }

    fn numeric_binop(
        &mut self,
        opcode: crate::plan::ArithOp,
        l: &DbValue,
        r: &DbValue,
    ) -> Option<DbValue> {
        use crate::plan::ArithOp;

        if let (Some(x), Some(y)) = (l.as_bigint(), r.as_bigint()) {
            let checked = match opcode {
                ArithOp::Add => x.checked_add(y),
                ArithOp::Sub => x.checked_sub(y),
                ArithOp::Mul => x.checked_mul(y),
                ArithOp::Div => {
                    if y == 0 {
                        self.error(EvalError::DivisionByZero);
                        return None;
                    }
                    x.checked_div(y)
                }
                ArithOp::Mod => {
                    if y == 0 {
                        self.error(EvalError::DivisionByZero);
                        return None;
                    }
                    x.checked_rem(y)
                }
                _ => unreachable!("unary operator in binop"),
            };
            return match checked {
                Some(v) => Some(DbValue::Bigint(v)),
                None => {
                    self.error(EvalError::Overflow);
                    None
                }
            };
        }

        let to_f = |v: &DbValue| -> Option<f64> {
            match v {
                DbValue::Int(x) => Some(*x as f64),
                DbValue::Bigint(x) => Some(*x as f64),
                DbValue::Double(x) => Some(*x),
                _ => None,
            }
        };
        let (Some(x), Some(y)) = (to_f(l), to_f(r)) else {
            self.error(EvalError::NotComparable);
            return None;
        };
        let v = match opcode {
            ArithOp::Add => x + y,
            ArithOp::Sub => x - y,
            ArithOp::Mul => x * y,
            ArithOp::Div => {
                if y == 0.0 {
                    self.error(EvalError::DivisionByZero);
                    return None;
                }
                x / y
            }
            ArithOp::Mod => {
                if y == 0.0 {
                    self.error(EvalError::DivisionByZero);
                    return None;
                }
                x % y
            }
            _ => unreachable!("unary operator in binop"),
        };
        Some(DbValue::Double(v))
    }

    fn eval_func(&mut self, func_id: crate::plan::FuncId) -> Option<DbValue> {
        let (ftype, operand, value_cell) = {
            let f = self.arena.func(func_id);
            (f.ftype, f.operand, f.value)
        };
        let mut vals = Vec::new();
        for regu in self.arena.regu_list_items(operand) {
            vals.push(self.fetch_peek(regu)?);
        }
        let result = match ftype {
            FuncType::Sequence => DbValue::Sequence(vals),
            FuncType::Elt => {
                // ELT(n, e1, e2, ...): 1-based pick; NULL or out-of-range
                // index yields NULL.
                match vals.split_first() {
                    Some((DbValue::Int(n), rest)) => rest
                        .get((*n - 1).max(-1) as usize)
                        .cloned()
                        .unwrap_or(DbValue::Null),
                    Some((DbValue::Bigint(n), rest)) => rest
                        .get((*n - 1).max(-1) as usize)
                        .cloned()
                        .unwrap_or(DbValue::Null),
                    _ => DbValue::Null,
                }
            }
        };
        self.arena.set_value(value_cell, result.clone());
        Some(result)
    }

    // -----------------------------------------------------------------
    // Nested list files
    // -----------------------------------------------------------------

    /// Make sure the list file behind a `ListId` regu-variable is
    /// materialized, running the linked plan if needed.
    fn ensure_materialized(&mut self, regu_id: ReguId) -> Result<SrListId, DbLogical> {
        let regu = self.arena.regu(regu_id);
        let ReguValue::ListId(srl) = &regu.value else {
            return Err(self.error(EvalError::BadPlan("expected a list-id regu variable")));
        };
        let srl = *srl;
        if !self.lists.contains(srl) {
            let Some(xasl) = regu.xasl else {
                return Err(self.error(EvalError::SubPlanFailure));
            };
            let Some(executor) = self.executor else {
                return Err(self.error(EvalError::SubPlanFailure));
            };
            if executor.execute(self.arena, xasl, &mut *self.lists).is_err()
                || self.arena.xasl(xasl).status.get() != XaslStatus::Success
                || !self.lists.contains(srl)
            {
                return Err(self.error(EvalError::SubPlanFailure));
            }
            let count = self.lists.get(srl).map(|l| l.tuples.len()).unwrap_or(0);
            self.arena.srlist(srl).list.tuple_cnt.set(count as i64);
        }
        Ok(srl)
    }

    /// Sort a materialized list with the total value order, once.
    fn sort_list(&mut self, srl: SrListId) {
        if let Some(list) = self.lists.get_mut(srl) {
            if !list.sorted {
                list.tuples.sort_by(|a, b| {
                    match tp_value_compare(a, b, true) {
                        Some(CmpResult::Lt) => std::cmp::Ordering::Less,
                        Some(CmpResult::Gt) => std::cmp::Ordering::Greater,
                        _ => std::cmp::Ordering::Equal,
                    }
                });
                list.sorted = true;
                self.arena.srlist(srl).sorted.set(true);
            }
        }
    }
}

/// Compare two values under a relational operator, with the SQL NULL
/// rules: ordinal operators yield UNKNOWN on any NULL operand; the
/// total-order and NULL-safe equalities treat NULL = NULL as TRUE.
pub fn eval_value_rel_cmp(
    ctx: &mut EvalContext<'_>,
    v1: &DbValue,
    v2: &DbValue,
    rel_op: RelOp,
) -> DbLogical {
    let total_order = rel_op == RelOp::EqTorder;
    let Some(result) = tp_value_compare(v1, v2, total_order) else {
        return ctx.error(EvalError::NotComparable);
    };

    if result == CmpResult::Unknown && rel_op != RelOp::NullsafeEq {
        return DbLogical::Unknown;
    }

    match rel_op {
        RelOp::Eq | RelOp::EqTorder => bool_to_logical(result == CmpResult::Eq),
        RelOp::Ne => bool_to_logical(result != CmpResult::Eq),
        RelOp::Lt => bool_to_logical(result == CmpResult::Lt),
        RelOp::Le => bool_to_logical(matches!(result, CmpResult::Lt | CmpResult::Eq)),
        RelOp::Gt => bool_to_logical(result == CmpResult::Gt),
        RelOp::Ge => bool_to_logical(matches!(result, CmpResult::Gt | CmpResult::Eq)),
        RelOp::NullsafeEq => {
            if result == CmpResult::Eq {
                DbLogical::True
            } else if v1.is_null() {
                bool_to_logical(v2.is_null())
            } else {
                DbLogical::False
            }
        }
        _ => ctx.error(EvalError::BadPlan("relational operator without operands")),
    }
}

fn bool_to_logical(b: bool) -> DbLogical {
    if b {
        DbLogical::True
    } else {
        DbLogical::False
    }
}

/// Quantified comparison of `item` against the members of a set.
///
/// SOME holds when some member is determined to hold the relationship;
/// ALL when every member does. UNKNOWN is sticky: it survives unless a
/// decisive member appears.
fn eval_quantified_set(
    ctx: &mut EvalContext<'_>,
    item: &DbValue,
    members: &[DbValue],
    rel_op: RelOp,
    quantifier: QlFlag,
) -> DbLogical {
    let (decisive, default) = match quantifier {
        QlFlag::Some => (DbLogical::True, DbLogical::False),
        QlFlag::All => (DbLogical::False, DbLogical::True),
    };
    let mut res = default;
    for member in members {
        let t_res = if member.is_null() {
            DbLogical::Unknown
        } else {
            eval_value_rel_cmp(ctx, item, member, rel_op)
        };
        if t_res == decisive || t_res == DbLogical::Error {
            return if t_res == DbLogical::Error {
                DbLogical::Error
            } else {
                decisive
            };
        }
        if t_res == DbLogical::Unknown {
            res = DbLogical::Unknown;
        }
    }
    res
}

/// The general recursive predicate evaluator.
pub fn eval_pred(ctx: &mut EvalContext<'_>, pred_id: PredId) -> DbLogical {
    if ctx.depth >= ctx.max_depth {
        let bound = ctx.max_depth;
        return ctx.error(EvalError::MaxRecursionDepth(bound));
    }
    ctx.depth += 1;
    let result = eval_pred_inner(ctx, pred_id);
    ctx.depth -= 1;
    result
}

fn eval_pred_inner(ctx: &mut EvalContext<'_>, pred_id: PredId) -> DbLogical {
    match ctx.arena.pred(pred_id) {
        PredExpr::Pred(pred) => match pred.bool_op {
            // AND and OR chains are right-linear; walk them iteratively,
            // short-circuiting on the dominant value.
            BoolOp::And => eval_chain(ctx, pred_id, BoolOp::And),
            BoolOp::Or => eval_chain(ctx, pred_id, BoolOp::Or),
            BoolOp::Xor => {
                let (lhs, rhs) = (pred.lhs, pred.rhs);
                let result_lhs = eval_pred_opt(ctx, lhs);
                let result_rhs = eval_pred_opt(ctx, rhs);
                if result_lhs == DbLogical::Error || result_rhs == DbLogical::Error {
                    DbLogical::Error
                } else if result_lhs == DbLogical::Unknown || result_rhs == DbLogical::Unknown {
                    DbLogical::Unknown
                } else if result_lhs == result_rhs {
                    DbLogical::False
                } else {
                    DbLogical::True
                }
            }
            BoolOp::Is | BoolOp::IsNot => {
                // Two-valued over the four states: equality of the operand
                // results yields the IS answer, anything else the IS NOT
                // answer; ERROR propagates.
                let v_true = if pred.bool_op == BoolOp::Is {
                    DbLogical::True
                } else {
                    DbLogical::False
                };
                let (lhs, rhs) = (pred.lhs, pred.rhs);
                let result_lhs = eval_pred_opt(ctx, lhs);
                let result_rhs = eval_pred_opt(ctx, rhs);
                if result_lhs == DbLogical::Error || result_rhs == DbLogical::Error {
                    DbLogical::Error
                } else if result_lhs == result_rhs {
                    v_true
                } else {
                    v_true.negate()
                }
            }
        },
        PredExpr::Term(term) => eval_term(ctx, term),
        PredExpr::Not(inner) => eval_pred_opt(ctx, *inner).negate(),
    }
}

fn eval_pred_opt(ctx: &mut EvalContext<'_>, pred: Option<PredId>) -> DbLogical {
    match pred {
        Some(id) => eval_pred(ctx, id),
        None => ctx.error(EvalError::BadPlan("missing predicate operand")),
    }
}

fn eval_chain(ctx: &mut EvalContext<'_>, head: PredId, op: BoolOp) -> DbLogical {
    let (neutral, dominant) = match op {
        BoolOp::And => (DbLogical::True, DbLogical::False),
        _ => (DbLogical::False, DbLogical::True),
    };

    let mut result = neutral;
    let mut t = head;
    loop {
        let PredExpr::Pred(pred) = ctx.arena.pred(t) else {
            break;
        };
        if pred.bool_op != op || result != neutral {
            break;
        }
        let (lhs, rhs) = (pred.lhs, pred.rhs);
        result = eval_pred_opt(ctx, lhs);
        if result == dominant || result == DbLogical::Error {
            return result;
        }
        let Some(rhs) = rhs else {
            return ctx.error(EvalError::BadPlan("connective without right operand"));
        };
        t = rhs;
    }

    // The rest of the chain; an UNKNOWN accumulated so far caps a TRUE
    // (resp. FALSE) tail at UNKNOWN.
    let tail = eval_pred(ctx, t);
    if result == DbLogical::Unknown && tail == neutral {
        DbLogical::Unknown
    } else {
        tail
    }
}

fn eval_term(ctx: &mut EvalContext<'_>, term: &EvalTerm) -> DbLogical {
    match term {
        EvalTerm::Comp(comp) => eval_comp_term(ctx, comp),
        EvalTerm::Alsm(alsm) => eval_alsm_term(ctx, alsm),
        EvalTerm::Like(like) => eval_like_term(ctx, like),
        EvalTerm::Rlike(rlike) => eval_rlike_term(ctx, rlike),
    }
}

fn eval_comp_term(ctx: &mut EvalContext<'_>, comp: &CompTerm) -> DbLogical {
    match comp.rel_op {
        RelOp::Null => {
            let Some(lhs) = comp.lhs else {
                return ctx.error(EvalError::BadPlan("NULL test without operand"));
            };
            let Some(v) = ctx.fetch_peek(lhs) else {
                return DbLogical::Error;
            };
            bool_to_logical(v.is_null())
        }
        RelOp::Exists => {
            let Some(lhs) = comp.lhs else {
                return ctx.error(EvalError::BadPlan("EXISTS without operand"));
            };
            match ctx.ensure_materialized(lhs) {
                Ok(srl) => {
                    let cnt = ctx.lists.get(srl).map(|l| l.tuples.len()).unwrap_or(0);
                    bool_to_logical(cnt > 0)
                }
                Err(e) => e,
            }
        }
        rel_op => {
            let (Some(lhs), Some(rhs)) = (comp.lhs, comp.rhs) else {
                return ctx.error(EvalError::BadPlan("comparison without operands"));
            };
            let Some(v1) = ctx.fetch_peek(lhs) else {
                return DbLogical::Error;
            };
            if v1.is_null() && rel_op != RelOp::EqTorder && rel_op != RelOp::NullsafeEq {
                return DbLogical::Unknown;
            }
            let Some(v2) = ctx.fetch_peek(rhs) else {
                return DbLogical::Error;
            };
            if v2.is_null() && rel_op != RelOp::EqTorder && rel_op != RelOp::NullsafeEq {
                return DbLogical::Unknown;
            }
            eval_value_rel_cmp(ctx, &v1, &v2, rel_op)
        }
    }
}

fn eval_alsm_term(ctx: &mut EvalContext<'_>, alsm: &AlsmTerm) -> DbLogical {
    let (Some(elem), Some(elemset)) = (alsm.elem, alsm.elemset) else {
        return ctx.error(EvalError::BadPlan("quantified term without operands"));
    };
    // An empty set or list decides the comparison by itself, regardless
    // of whether the element value is bound (ANSI).
    let empty_result = match alsm.eq_flag {
        QlFlag::Some => DbLogical::False,
        QlFlag::All => DbLogical::True,
    };

    if matches!(ctx.arena.regu(elemset).value, ReguValue::ListId(_)) {
        let srl = match ctx.ensure_materialized(elemset) {
            Ok(srl) => srl,
            Err(e) => return e,
        };
        if ctx.lists.get(srl).map(|l| l.tuples.is_empty()).unwrap_or(true) {
            return empty_result;
        }
        let Some(item) = ctx.fetch_peek(elem) else {
            return DbLogical::Error;
        };
        if item.is_null() {
            return DbLogical::Unknown;
        }
        // List evaluation wants the list ordered.
        ctx.sort_list(srl);
        let members = ctx
            .lists
            .get(srl)
            .map(|l| l.tuples.clone())
            .unwrap_or_default();
        eval_quantified_set(ctx, &item, &members, alsm.rel_op, alsm.eq_flag)
    } else {
        let Some(set_val) = ctx.fetch_peek(elemset) else {
            return DbLogical::Error;
        };
        if set_val.is_null() {
            return DbLogical::Unknown;
        }
        let Some(members) = set_val.as_sequence() else {
            return ctx.error(EvalError::NotComparable);
        };
        if members.is_empty() {
            return empty_result;
        }
        let members = members.to_vec();
        let Some(item) = ctx.fetch_peek(elem) else {
            return DbLogical::Error;
        };
        if item.is_null() {
            return DbLogical::Unknown;
        }
        eval_quantified_set(ctx, &item, &members, alsm.rel_op, alsm.eq_flag)
    }
}

fn eval_like_term(ctx: &mut EvalContext<'_>, like: &LikeTerm) -> DbLogical {
    let (Some(src), Some(pattern)) = (like.src, like.pattern) else {
        return ctx.error(EvalError::BadPlan("LIKE without operands"));
    };
    let Some(src_val) = ctx.fetch_peek(src) else {
        return DbLogical::Error;
    };
    if src_val.is_null() {
        return DbLogical::Unknown;
    }
    let Some(pattern_val) = ctx.fetch_peek(pattern) else {
        return DbLogical::Error;
    };
    if pattern_val.is_null() {
        return DbLogical::Unknown;
    }
    let esc = match like.esc_char {
        Some(esc_regu) => {
            let Some(esc_val) = ctx.fetch_peek(esc_regu) else {
                return DbLogical::Error;
            };
            match esc_val {
                DbValue::Null => None,
                DbValue::Varchar(s) => s.chars().next(),
                _ => return ctx.error(EvalError::NotComparable),
            }
        }
        None => None,
    };
    let (Some(src_str), Some(pat_str)) = (src_val.as_str(), pattern_val.as_str()) else {
        return ctx.error(EvalError::NotComparable);
    };
    match like::string_like(src_str, pat_str, esc) {
        Some(hit) => bool_to_logical(hit),
        None => ctx.error(EvalError::BadPlan("malformed LIKE pattern")),
    }
}

fn eval_rlike_term(ctx: &mut EvalContext<'_>, rlike: &RlikeTerm) -> DbLogical {
    let (Some(src), Some(pattern), Some(case_sensitive)) =
        (rlike.src, rlike.pattern, rlike.case_sensitive)
    else {
        return ctx.error(EvalError::BadPlan("RLIKE without operands"));
    };
    let Some(src_val) = ctx.fetch_peek(src) else {
        return DbLogical::Error;
    };
    if src_val.is_null() {
        return DbLogical::Unknown;
    }
    let Some(pattern_val) = ctx.fetch_peek(pattern) else {
        return DbLogical::Error;
    };
    if pattern_val.is_null() {
        return DbLogical::Unknown;
    }
    let Some(case_val) = ctx.fetch_peek(case_sensitive) else {
        return DbLogical::Error;
    };
    if case_val.is_null() {
        return DbLogical::Unknown;
    }

    let (Some(src_str), Some(pat_str)) = (src_val.as_str(), pattern_val.as_str()) else {
        return ctx.error(EvalError::NotComparable);
    };
    let sensitive = case_val.as_bigint().map(|v| v != 0).unwrap_or(false);

    match rlike
        .compiled
        .with_compiled(pat_str, sensitive, |re| re.is_match(src_str))
    {
        Ok(hit) => bool_to_logical(hit),
        Err(e) => ctx.error(EvalError::Regex(e.to_string())),
    }
}

// ---------------------------------------------------------------------
// Specialized single-term entry points
// ---------------------------------------------------------------------

fn term_of<'a>(ctx: &EvalContext<'a>, pred_id: PredId) -> Option<&'a EvalTerm> {
    match ctx.arena.pred(pred_id) {
        PredExpr::Term(term) => Some(term),
        _ => None,
    }
}

/// Single-term two-operand comparison.
pub fn eval_pred_comp0(ctx: &mut EvalContext<'_>, pred_id: PredId) -> DbLogical {
    let Some(EvalTerm::Comp(comp)) = term_of(ctx, pred_id) else {
        return ctx.error(EvalError::BadPlan("comp0 on a non-comparison predicate"));
    };
    eval_comp_term(ctx, comp)
}

/// Single-term NULL test.
pub fn eval_pred_comp1(ctx: &mut EvalContext<'_>, pred_id: PredId) -> DbLogical {
    let Some(EvalTerm::Comp(comp)) = term_of(ctx, pred_id) else {
        return ctx.error(EvalError::BadPlan("comp1 on a non-comparison predicate"));
    };
    let Some(lhs) = comp.lhs else {
        return ctx.error(EvalError::BadPlan("NULL test without operand"));
    };
    let Some(v) = ctx.fetch_peek(lhs) else {
        return DbLogical::Error;
    };
    bool_to_logical(v.is_null())
}

/// Single-term quantified comparison against a set value.
pub fn eval_pred_alsm4(ctx: &mut EvalContext<'_>, pred_id: PredId) -> DbLogical {
    let Some(EvalTerm::Alsm(alsm)) = term_of(ctx, pred_id) else {
        return ctx.error(EvalError::BadPlan("alsm4 on a non-quantified predicate"));
    };
    eval_alsm_term(ctx, alsm)
}

/// Single-term quantified comparison against a list file.
pub fn eval_pred_alsm5(ctx: &mut EvalContext<'_>, pred_id: PredId) -> DbLogical {
    eval_pred_alsm4(ctx, pred_id)
}

/// Single-term LIKE.
pub fn eval_pred_like6(ctx: &mut EvalContext<'_>, pred_id: PredId) -> DbLogical {
    let Some(EvalTerm::Like(like)) = term_of(ctx, pred_id) else {
        return ctx.error(EvalError::BadPlan("like6 on a non-LIKE predicate"));
    };
    eval_like_term(ctx, like)
}

/// Single-term RLIKE. The compiled pattern is cached on the plan node and
/// reused across evaluations.
pub fn eval_pred_rlike7(ctx: &mut EvalContext<'_>, pred_id: PredId) -> DbLogical {
    let Some(EvalTerm::Rlike(rlike)) = term_of(ctx, pred_id) else {
        return ctx.error(EvalError::BadPlan("rlike7 on a non-RLIKE predicate"));
    };
    eval_rlike_term(ctx, rlike)
}

/// Pick the evaluation entry for a predicate: a specialized function for
/// single-term predicates, the general evaluator otherwise.
pub fn eval_fnc(arena: &PlanArena, pred_id: PredId) -> PrEvalFn {
    match arena.pred(pred_id) {
        PredExpr::Term(EvalTerm::Comp(comp)) => {
            if comp.rel_op == RelOp::Null {
                eval_pred_comp1
            } else if comp.rel_op == RelOp::Exists {
                eval_pred
            } else {
                eval_pred_comp0
            }
        }
        PredExpr::Term(EvalTerm::Alsm(alsm)) => {
            let list_based = alsm
                .elemset
                .map(|e| matches!(arena.regu(e).value, ReguValue::ListId(_)))
                .unwrap_or(false);
            if list_based {
                eval_pred_alsm5
            } else {
                eval_pred_alsm4
            }
        }
        PredExpr::Term(EvalTerm::Like(_)) => eval_pred_like6,
        PredExpr::Term(EvalTerm::Rlike(_)) => eval_pred_rlike7,
        _ => eval_pred,
    }
}

/// Whether a LIMIT count expression evaluates to zero.
pub fn eval_limit_count_is_0(ctx: &mut EvalContext<'_>, regu: ReguId) -> DbLogical {
    let Some(v) = ctx.fetch_peek(regu) else {
        return DbLogical::Unknown;
    };
    eval_value_rel_cmp(ctx, &v, &DbValue::Int(0), RelOp::Eq)
}

// ---------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------

/// Evaluate a data filter over a heap record.
///
/// The filter's attributes are loaded from the record into the attribute
/// cache first; when the predicate passes, the filter's regu list is
/// fetched from the cached values.
pub fn eval_data_filter<'a>(
    ctx: &mut EvalContext<'a>,
    oid: Oid,
    record: &[(i32, DbValue)],
    filter: &FilterInfo<'a>,
) -> DbLogical {
    if filter.scan_pred.regu_list.is_some() {
        filter.attr_cache.read_record(record);
    }
    ctx.oid = Some(oid);
    ctx.attr_cache = Some(filter.attr_cache);

    let mut ev_res = DbLogical::True;
    if let Some(pred) = filter.scan_pred.pred {
        let eval = filter.scan_pred.eval_fn.unwrap_or(eval_pred);
        ev_res = eval(ctx, pred);
    }

    if ev_res == DbLogical::True
        && filter.scan_pred.regu_list.is_some()
        && ctx.fetch_val_list(filter.scan_pred.regu_list).is_none()
    {
        return DbLogical::Error;
    }
    ev_res
}

/// Evaluate a key filter over a decoded index key.
///
/// The key's column values are bound in place into the attribute cache,
/// matched by the index attribute ids; attributes that are not key
/// columns become NULL.
pub fn eval_key_filter<'a>(
    ctx: &mut EvalContext<'a>,
    key: &[DbValue],
    filter: &FilterInfo<'a>,
) -> DbLogical {
    let Some(index) = &filter.index else {
        return ctx.error(EvalError::BadPlan("key filter without index info"));
    };

    if filter.scan_pred.pred.is_some() {
        for attr_id in &filter.attr_ids {
            let pos = index.atts.iter().position(|a| a == attr_id);
            let value = match pos.and_then(|j| key.get(j)) {
                Some(v) => v.clone(),
                None => DbValue::Null,
            };
            filter.attr_cache.set(*attr_id, value);
        }
    }

    ctx.attr_cache = Some(filter.attr_cache);
    match filter.scan_pred.pred {
        Some(pred) => {
            let eval = filter.scan_pred.eval_fn.unwrap_or(eval_pred);
            eval(ctx, pred)
        }
        None => DbLogical::True,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{Pred, ReguFlags, ReguVariable};

    fn const_regu(arena: &mut PlanArena, v: DbValue) -> ReguId {
        let val = arena.alloc_value(v);
        arena.alloc_regu(ReguVariable {
            flags: ReguFlags::empty(),
            vfetch_to: None,
            xasl: None,
            value: ReguValue::DbVal(val),
        })
    }

    fn comp(arena: &mut PlanArena, l: DbValue, r: DbValue, op: RelOp) -> PredId {
        let lhs = const_regu(arena, l);
        let rhs = const_regu(arena, r);
        arena.alloc_pred(PredExpr::Term(EvalTerm::Comp(CompTerm {
            lhs: Some(lhs),
            rhs: Some(rhs),
            rel_op: op,
        })))
    }

    /// A leaf predicate with a fixed truth value.
    fn leaf(arena: &mut PlanArena, v: DbLogical) -> PredId {
        match v {
            DbLogical::True => comp(arena, DbValue::Int(1), DbValue::Int(1), RelOp::Eq),
            DbLogical::False => comp(arena, DbValue::Int(1), DbValue::Int(2), RelOp::Eq),
            DbLogical::Unknown => comp(arena, DbValue::Null, DbValue::Int(1), RelOp::Eq),
            DbLogical::Error => comp(
                arena,
                DbValue::Int(1),
                DbValue::Varchar("x".into()),
                RelOp::Eq,
            ),
        }
    }

    fn connect(arena: &mut PlanArena, op: BoolOp, lhs: PredId, rhs: PredId) -> PredId {
        arena.alloc_pred(PredExpr::Pred(Pred {
            lhs: Some(lhs),
            rhs: Some(rhs),
            bool_op: op,
        }))
    }

    fn run(arena: &PlanArena, pred: PredId) -> DbLogical {
        let mut lists = ListStore::new();
        let mut ctx = EvalContext::new(arena, &mut lists);
        eval_pred(&mut ctx, pred)
    }

    const TFU: [DbLogical; 3] = [DbLogical::True, DbLogical::False, DbLogical::Unknown];

    fn and_expected(a: DbLogical, b: DbLogical) -> DbLogical {
        use DbLogical::*;
        match (a, b) {
            (False, _) | (_, False) => False,
            (Unknown, _) | (_, Unknown) => Unknown,
            _ => True,
        }
    }

    fn or_expected(a: DbLogical, b: DbLogical) -> DbLogical {
        use DbLogical::*;
        match (a, b) {
            (True, _) | (_, True) => True,
            (Unknown, _) | (_, Unknown) => Unknown,
            _ => False,
        }
    }

    #[test]
    fn and_or_truth_tables() {
        for a in TFU {
            for b in TFU {
                let mut arena = PlanArena::new();
                let (la, lb) = (leaf(&mut arena, a), leaf(&mut arena, b));
                let p = connect(&mut arena, BoolOp::And, la, lb);
                assert_eq!(run(&arena, p), and_expected(a, b), "{a:?} AND {b:?}");

                let mut arena = PlanArena::new();
                let (la, lb) = (leaf(&mut arena, a), leaf(&mut arena, b));
                let p = connect(&mut arena, BoolOp::Or, la, lb);
                assert_eq!(run(&arena, p), or_expected(a, b), "{a:?} OR {b:?}");
            }
        }
    }

    #[test]
    fn and_or_commute() {
        for a in TFU {
            for b in TFU {
                for op in [BoolOp::And, BoolOp::Or] {
                    let mut arena = PlanArena::new();
                    let (la, lb) = (leaf(&mut arena, a), leaf(&mut arena, b));
                    let ab = connect(&mut arena, op, la, lb);
                    let (la, lb) = (leaf(&mut arena, a), leaf(&mut arena, b));
                    let ba = connect(&mut arena, op, lb, la);
                    assert_eq!(run(&arena, ab), run(&arena, ba));
                }
            }
        }
    }

    #[test]
    fn and_or_associate() {
        for a in TFU {
            for b in TFU {
                for c in TFU {
                    for op in [BoolOp::And, BoolOp::Or] {
                        let mut arena = PlanArena::new();
                        let (la, lb, lc) =
                            (leaf(&mut arena, a), leaf(&mut arena, b), leaf(&mut arena, c));
                        let bc = connect(&mut arena, op, lb, lc);
                        let right = connect(&mut arena, op, la, bc);
                        let (la2, lb2, lc2) =
                            (leaf(&mut arena, a), leaf(&mut arena, b), leaf(&mut arena, c));
                        let ab = connect(&mut arena, op, la2, lb2);
                        let left = connect(&mut arena, op, ab, lc2);
                        assert_eq!(run(&arena, right), run(&arena, left));
                    }
                }
            }
        }
    }

    #[test]
    fn double_negation_is_identity() {
        for v in TFU {
            let mut arena = PlanArena::new();
            let l = leaf(&mut arena, v);
            let n = arena.alloc_pred(PredExpr::Not(Some(l)));
            let nn = arena.alloc_pred(PredExpr::Not(Some(n)));
            assert_eq!(run(&arena, nn), v);
        }
        // And both sides turn an error into an error.
        let mut arena = PlanArena::new();
        let l = leaf(&mut arena, DbLogical::Error);
        let n = arena.alloc_pred(PredExpr::Not(Some(l)));
        let nn = arena.alloc_pred(PredExpr::Not(Some(n)));
        assert_eq!(run(&arena, l), DbLogical::Error);
        assert_eq!(run(&arena, nn), DbLogical::Error);
    }

    #[test]
    fn xor_and_is() {
        use DbLogical::*;
        let cases = [
            (True, True, BoolOp::Xor, False),
            (True, False, BoolOp::Xor, True),
            (Unknown, True, BoolOp::Xor, Unknown),
            (True, True, BoolOp::Is, True),
            (True, False, BoolOp::Is, False),
            (Unknown, Unknown, BoolOp::Is, True),
            (Unknown, False, BoolOp::Is, False),
            (True, False, BoolOp::IsNot, True),
            (Unknown, Unknown, BoolOp::IsNot, False),
        ];
        for (a, b, op, want) in cases {
            let mut arena = PlanArena::new();
            let (la, lb) = (leaf(&mut arena, a), leaf(&mut arena, b));
            let p = connect(&mut arena, op, la, lb);
            assert_eq!(run(&arena, p), want, "{a:?} {op:?} {b:?}");
        }
    }

    #[test]
    fn null_comparison_rules() {
        let ordinal = [RelOp::Eq, RelOp::Ne, RelOp::Lt, RelOp::Le, RelOp::Gt, RelOp::Ge];
        for op in ordinal {
            let mut arena = PlanArena::new();
            let p = comp(&mut arena, DbValue::Null, DbValue::Null, op);
            assert_eq!(run(&arena, p), DbLogical::Unknown, "{op:?}");
        }
        let mut arena = PlanArena::new();
        let p = comp(&mut arena, DbValue::Null, DbValue::Null, RelOp::EqTorder);
        assert_eq!(run(&arena, p), DbLogical::True);
        let mut arena = PlanArena::new();
        let p = comp(&mut arena, DbValue::Null, DbValue::Null, RelOp::NullsafeEq);
        assert_eq!(run(&arena, p), DbLogical::True);
        let mut arena = PlanArena::new();
        let p = comp(&mut arena, DbValue::Null, DbValue::Int(5), RelOp::EqTorder);
        assert_eq!(run(&arena, p), DbLogical::False);
    }

    #[test]
    fn null_test_is_two_valued() {
        let mut arena = PlanArena::new();
        let lhs = const_regu(&mut arena, DbValue::Null);
        let p = arena.alloc_pred(PredExpr::Term(EvalTerm::Comp(CompTerm {
            lhs: Some(lhs),
            rhs: None,
            rel_op: RelOp::Null,
        })));
        assert_eq!(run(&arena, p), DbLogical::True);
        assert_eq!(eval_fnc(&arena, p) as usize, eval_pred_comp1 as usize);

        let mut arena = PlanArena::new();
        let lhs = const_regu(&mut arena, DbValue::Int(0));
        let p = arena.alloc_pred(PredExpr::Term(EvalTerm::Comp(CompTerm {
            lhs: Some(lhs),
            rhs: None,
            rel_op: RelOp::Null,
        })));
        assert_eq!(run(&arena, p), DbLogical::False);
    }

    fn alsm_pred(
        arena: &mut PlanArena,
        elem: DbValue,
        set: Vec<DbValue>,
        op: RelOp,
        quantifier: QlFlag,
    ) -> PredId {
        let elem = const_regu(arena, elem);
        let set = const_regu(arena, DbValue::Sequence(set));
        arena.alloc_pred(PredExpr::Term(EvalTerm::Alsm(AlsmTerm {
            elem: Some(elem),
            elemset: Some(set),
            eq_flag: quantifier,
            rel_op: op,
        })))
    }

    #[test]
    fn some_over_sets() {
        let mut arena = PlanArena::new();
        let p = alsm_pred(
            &mut arena,
            DbValue::Int(2),
            vec![DbValue::Int(1), DbValue::Int(2)],
            RelOp::Eq,
            QlFlag::Some,
        );
        assert_eq!(run(&arena, p), DbLogical::True);

        // No match plus a NULL member: sticky UNKNOWN.
        let mut arena = PlanArena::new();
        let p = alsm_pred(
            &mut arena,
            DbValue::Int(9),
            vec![DbValue::Int(1), DbValue::Null],
            RelOp::Eq,
            QlFlag::Some,
        );
        assert_eq!(run(&arena, p), DbLogical::Unknown);

        // Empty set is FALSE even with a NULL element value.
        let mut arena = PlanArena::new();
        let p = alsm_pred(&mut arena, DbValue::Null, vec![], RelOp::Eq, QlFlag::Some);
        assert_eq!(run(&arena, p), DbLogical::False);

        // NULL set is UNKNOWN.
        let mut arena = PlanArena::new();
        let elem = const_regu(&mut arena, DbValue::Int(1));
        let set = const_regu(&mut arena, DbValue::Null);
        let p = arena.alloc_pred(PredExpr::Term(EvalTerm::Alsm(AlsmTerm {
            elem: Some(elem),
            elemset: Some(set),
            eq_flag: QlFlag::Some,
            rel_op: RelOp::Eq,
        })));
        assert_eq!(run(&arena, p), DbLogical::Unknown);
    }

    #[test]
    fn all_over_sets() {
        let mut arena = PlanArena::new();
        let p = alsm_pred(
            &mut arena,
            DbValue::Int(5),
            vec![DbValue::Int(1), DbValue::Int(2)],
            RelOp::Gt,
            QlFlag::All,
        );
        assert_eq!(run(&arena, p), DbLogical::True);

        let mut arena = PlanArena::new();
        let p = alsm_pred(
            &mut arena,
            DbValue::Int(5),
            vec![DbValue::Int(1), DbValue::Int(9)],
            RelOp::Gt,
            QlFlag::All,
        );
        assert_eq!(run(&arena, p), DbLogical::False);

        // Empty set is TRUE for ALL.
        let mut arena = PlanArena::new();
        let p = alsm_pred(&mut arena, DbValue::Int(5), vec![], RelOp::Gt, QlFlag::All);
        assert_eq!(run(&arena, p), DbLogical::True);
    }

    #[test]
    fn like_terms() {
        let mut arena = PlanArena::new();
        let src = const_regu(&mut arena, "rye storage".into());
        let pat = const_regu(&mut arena, "rye%".into());
        let p = arena.alloc_pred(PredExpr::Term(EvalTerm::Like(LikeTerm {
            src: Some(src),
            pattern: Some(pat),
            esc_char: None,
        })));
        assert_eq!(run(&arena, p), DbLogical::True);
        assert_eq!(eval_fnc(&arena, p) as usize, eval_pred_like6 as usize);

        // NULL pattern: UNKNOWN.
        let mut arena = PlanArena::new();
        let src = const_regu(&mut arena, "x".into());
        let pat = const_regu(&mut arena, DbValue::Null);
        let p = arena.alloc_pred(PredExpr::Term(EvalTerm::Like(LikeTerm {
            src: Some(src),
            pattern: Some(pat),
            esc_char: None,
        })));
        assert_eq!(run(&arena, p), DbLogical::Unknown);
    }

    #[test]
    fn rlike_caches_compilation() {
        let mut arena = PlanArena::new();
        let src = const_regu(&mut arena, "abc123".into());
        let pat = const_regu(&mut arena, "^[a-z]+[0-9]+$".into());
        let cs = const_regu(&mut arena, DbValue::Int(1));
        let p = arena.alloc_pred(PredExpr::Term(EvalTerm::Rlike(RlikeTerm {
            src: Some(src),
            pattern: Some(pat),
            case_sensitive: Some(cs),
            compiled: crate::plan::RegexCell::new(),
        })));
        assert_eq!(run(&arena, p), DbLogical::True);
        let PredExpr::Term(EvalTerm::Rlike(term)) = arena.pred(p) else {
            unreachable!()
        };
        assert!(term.compiled.is_compiled());
        // Second evaluation reuses the compiled pattern.
        assert_eq!(run(&arena, p), DbLogical::True);
        assert_eq!(eval_fnc(&arena, p) as usize, eval_pred_rlike7 as usize);
    }

    #[test]
    fn recursion_depth_is_bounded() {
        let mut arena = PlanArena::new();
        let mut p = leaf(&mut arena, DbLogical::True);
        for _ in 0..64 {
            let t = leaf(&mut arena, DbLogical::True);
            // Left-deep so the chain walker cannot flatten it.
            p = connect(&mut arena, BoolOp::And, p, t);
        }
        let mut lists = ListStore::new();
        let mut ctx = EvalContext::new(&arena, &mut lists);
        ctx.max_depth = 16;
        assert_eq!(eval_pred(&mut ctx, p), DbLogical::Error);
        assert!(matches!(
            ctx.last_error,
            Some(EvalError::MaxRecursionDepth(16))
        ));
    }

    struct FixedExecutor {
        rows: Vec<DbValue>,
    }

    impl PlanExecutor for FixedExecutor {
        fn execute(
            &self,
            arena: &PlanArena,
            xasl: XaslId,
            lists: &mut ListStore,
        ) -> Result<(), EvalError> {
            let srl = find_srlist(arena, xasl).expect("plan without a list");
            lists.insert(srl, self.rows.clone());
            arena.xasl(xasl).status.set(XaslStatus::Success);
            Ok(())
        }
    }

    fn find_srlist(_arena: &PlanArena, _xasl: XaslId) -> Option<SrListId> {
        // The test plans carry exactly one sorted list.
        Some(SrListId(0))
    }

    fn list_plan(arena: &mut PlanArena) -> (ReguId, XaslId) {
        use crate::plan::{BuildListProc, ListDescr, ProcKind, SortedListId, XaslNode};
        let xasl = arena.alloc_xasl(XaslNode::new(ProcKind::BuildList(BuildListProc {
            groupby_list: None,
            g_outptr_list: None,
            g_regu_list: None,
            g_val_list: None,
            g_having_pred: None,
            g_grbynum_val: None,
            g_with_rollup: false,
            agg_list: None,
        })));
        let srl = arena.alloc_srlist(SortedListId {
            sorted: std::cell::Cell::new(false),
            list: ListDescr {
                tuple_cnt: std::cell::Cell::new(0),
            },
        });
        let regu = arena.alloc_regu(ReguVariable {
            flags: ReguFlags::empty(),
            vfetch_to: None,
            xasl: Some(xasl),
            value: ReguValue::ListId(srl),
        });
        (regu, xasl)
    }

    #[test]
    fn exists_over_materialized_list() {
        let mut arena = PlanArena::new();
        let (regu, _xasl) = list_plan(&mut arena);
        let p = arena.alloc_pred(PredExpr::Term(EvalTerm::Comp(CompTerm {
            lhs: Some(regu),
            rhs: None,
            rel_op: RelOp::Exists,
        })));

        let executor = FixedExecutor {
            rows: vec![DbValue::Int(1)],
        };
        let mut lists = ListStore::new();
        let mut ctx = EvalContext::new(&arena, &mut lists);
        ctx.executor = Some(&executor);
        assert_eq!(eval_pred(&mut ctx, p), DbLogical::True);

        let executor = FixedExecutor { rows: vec![] };
        let mut lists = ListStore::new();
        let mut ctx = EvalContext::new(&arena, &mut lists);
        ctx.executor = Some(&executor);
        assert_eq!(eval_pred(&mut ctx, p), DbLogical::False);
    }

    #[test]
    fn some_over_list_sorts_first() {
        let mut arena = PlanArena::new();
        let (set_regu, _xasl) = list_plan(&mut arena);
        let elem = const_regu(&mut arena, DbValue::Int(7));
        let p = arena.alloc_pred(PredExpr::Term(EvalTerm::Alsm(AlsmTerm {
            elem: Some(elem),
            elemset: Some(set_regu),
            eq_flag: QlFlag::Some,
            rel_op: RelOp::Eq,
        })));
        assert_eq!(eval_fnc(&arena, p) as usize, eval_pred_alsm5 as usize);

        let executor = FixedExecutor {
            rows: vec![DbValue::Int(9), DbValue::Int(7), DbValue::Int(3)],
        };
        let mut lists = ListStore::new();
        let mut ctx = EvalContext::new(&arena, &mut lists);
        ctx.executor = Some(&executor);
        assert_eq!(eval_pred(&mut ctx, p), DbLogical::True);
        // The evaluator sorted the list on first use.
        assert!(lists.get(SrListId(0)).unwrap().sorted);
    }

    #[test]
    fn data_filter_reads_record_into_cache() {
        let mut arena = PlanArena::new();
        // attribute 12 = 'ok'
        let attr = arena.alloc_regu(ReguVariable {
            flags: ReguFlags::empty(),
            vfetch_to: None,
            xasl: None,
            value: ReguValue::Attr(crate::plan::AttrDescr { id: 12 }),
        });
        let want = const_regu(&mut arena, "ok".into());
        let p = arena.alloc_pred(PredExpr::Term(EvalTerm::Comp(CompTerm {
            lhs: Some(attr),
            rhs: Some(want),
            rel_op: RelOp::Eq,
        })));

        // The filter's regu list drives the reload of the cache from each
        // record.
        let regu_list = arena.alloc_regu_list(crate::plan::ReguListNode {
            value: attr,
            next: None,
        });
        let cache = AttrCache::new(&[12]);
        let filter = FilterInfo {
            scan_pred: ScanPred {
                regu_list: Some(regu_list),
                pred: Some(p),
                eval_fn: Some(eval_fnc(&arena, p)),
            },
            attr_ids: vec![12],
            attr_cache: &cache,
            class_oid: None,
            index: None,
        };

        let mut lists = ListStore::new();
        let mut ctx = EvalContext::new(&arena, &mut lists);
        let res = eval_data_filter(&mut ctx, Oid::NULL, &[(12, "ok".into())], &filter);
        assert_eq!(res, DbLogical::True);
        let res = eval_data_filter(&mut ctx, Oid::NULL, &[(12, "no".into())], &filter);
        assert_eq!(res, DbLogical::False);
    }

    #[test]
    fn key_filter_binds_key_columns() {
        let mut arena = PlanArena::new();
        let attr = arena.alloc_regu(ReguVariable {
            flags: ReguFlags::empty(),
            vfetch_to: None,
            xasl: None,
            value: ReguValue::Attr(crate::plan::AttrDescr { id: 7 }),
        });
        let want = const_regu(&mut arena, DbValue::Int(40));
        let p = arena.alloc_pred(PredExpr::Term(EvalTerm::Comp(CompTerm {
            lhs: Some(attr),
            rhs: Some(want),
            rel_op: RelOp::Ge,
        })));

        let cache = AttrCache::new(&[7]);
        let filter = FilterInfo {
            scan_pred: ScanPred {
                regu_list: None,
                pred: Some(p),
                eval_fn: None,
            },
            attr_ids: vec![7],
            attr_cache: &cache,
            class_oid: None,
            // The index is (attr 3, attr 7): attr 7 is key column 1.
            index: Some(IndexRepr { atts: vec![3, 7] }),
        };

        let mut lists = ListStore::new();
        let mut ctx = EvalContext::new(&arena, &mut lists);
        let res = eval_key_filter(&mut ctx, &[DbValue::Int(1), DbValue::Int(50)], &filter);
        assert_eq!(res, DbLogical::True);
        let res = eval_key_filter(&mut ctx, &[DbValue::Int(1), DbValue::Int(30)], &filter);
        assert_eq!(res, DbLogical::False);
    }

    #[test]
    fn arithmetic_in_predicates() {
        use crate::plan::{ArithExpr, ArithOp};
        let mut arena = PlanArena::new();
        let l = const_regu(&mut arena, DbValue::Int(40));
        let r = const_regu(&mut arena, DbValue::Int(2));
        let cell = arena.alloc_value(DbValue::Null);
        let arith = arena.alloc_arith(ArithExpr {
            value: cell,
            left: Some(l),
            right: Some(r),
            third: None,
            opcode: ArithOp::Add,
            pred: None,
        });
        let sum = arena.alloc_regu(ReguVariable {
            flags: ReguFlags::empty(),
            vfetch_to: None,
            xasl: None,
            value: ReguValue::InArith(arith),
        });
        let want = const_regu(&mut arena, DbValue::Int(42));
        let p = arena.alloc_pred(PredExpr::Term(EvalTerm::Comp(CompTerm {
            lhs: Some(sum),
            rhs: Some(want),
            rel_op: RelOp::Eq,
        })));
        assert_eq!(run(&arena, p), DbLogical::True);
        // The result cell was written through.
        assert_eq!(arena.value_clone(cell), DbValue::Bigint(42));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        use crate::plan::{ArithExpr, ArithOp};
        let mut arena = PlanArena::new();
        let l = const_regu(&mut arena, DbValue::Int(1));
        let r = const_regu(&mut arena, DbValue::Int(0));
        let cell = arena.alloc_value(DbValue::Null);
        let arith = arena.alloc_arith(ArithExpr {
            value: cell,
            left: Some(l),
            right: Some(r),
            third: None,
            opcode: ArithOp::Div,
            pred: None,
        });
        let quot = arena.alloc_regu(ReguVariable {
            flags: ReguFlags::empty(),
            vfetch_to: None,
            xasl: None,
            value: ReguValue::InArith(arith),
        });
        let want = const_regu(&mut arena, DbValue::Int(1));
        let p = arena.alloc_pred(PredExpr::Term(EvalTerm::Comp(CompTerm {
            lhs: Some(quot),
            rhs: Some(want),
            rel_op: RelOp::Eq,
        })));
        let mut lists = ListStore::new();
        let mut ctx = EvalContext::new(&arena, &mut lists);
        assert_eq!(eval_pred(&mut ctx, p), DbLogical::Error);
        assert_eq!(ctx.last_error, Some(EvalError::DivisionByZero));
    }

    #[test]
    fn limit_count_check() {
        let mut arena = PlanArena::new();
        let zero = const_regu(&mut arena, DbValue::Int(0));
        let one = const_regu(&mut arena, DbValue::Int(1));
        let mut lists = ListStore::new();
        let mut ctx = EvalContext::new(&arena, &mut lists);
        assert_eq!(eval_limit_count_is_0(&mut ctx, zero), DbLogical::True);
        assert_eq!(eval_limit_count_is_0(&mut ctx, one), DbLogical::False);
    }
}
