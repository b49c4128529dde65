//! Query execution plan graph.
//!
//! A restored plan is a pointer graph over a dozen node kinds. The graph
//! lives in a [`PlanArena`]: one typed store per node kind, with handles
//! (arena indices) in place of pointers. Shared substructures are shared
//! handles, so two references restored from the same stream offset compare
//! equal and see each other's updates; the whole graph is freed wholesale
//! when the arena drops.
//!
//! Value cells are `RefCell`s: plan execution is single-threaded, and the
//! evaluator writes fetched values through shared references while it
//! walks the tree.

pub mod pack;
pub mod restore;

use std::cell::{Cell, RefCell};
use std::sync::Mutex;

use crate::eval::PrEvalFn;
use crate::types::{Hfid, Oid, PageId, Vfid};
use crate::value::DbValue;

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub(crate) fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

define_handle!(XaslId);
define_handle!(PredId);
define_handle!(ReguId);
define_handle!(ReguListId);
define_handle!(ArithId);
define_handle!(AggId);
define_handle!(FuncId);
define_handle!(ValId);
define_handle!(SpecId);
define_handle!(IndxId);
define_handle!(SortId);
define_handle!(SrListId);
define_handle!(ValListId);
define_handle!(OutPtrId);

/// DISTINCT/ALL option of a query or an aggregate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum QueryOptions {
    Distinct = 0,
    All = 1,
}

/// Boolean connectives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum BoolOp {
    And = 1,
    Or = 2,
    Xor = 3,
    Is = 4,
    IsNot = 5,
}

/// Relational operators of comparison and quantified terms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum RelOp {
    Eq = 1,
    Ne = 2,
    Gt = 3,
    Ge = 4,
    Lt = 5,
    Le = 6,
    /// Unary IS NULL test; always two-valued.
    Null = 7,
    Exists = 8,
    Like = 9,
    /// Total-order equality: NULL = NULL is TRUE, NULL = v is FALSE.
    EqTorder = 10,
    /// NULL-safe equality (`<=>`).
    NullsafeEq = 11,
}

impl RelOp {
    pub fn from_i32(v: i32) -> Option<RelOp> {
        Some(match v {
            1 => RelOp::Eq,
            2 => RelOp::Ne,
            3 => RelOp::Gt,
            4 => RelOp::Ge,
            5 => RelOp::Lt,
            6 => RelOp::Le,
            7 => RelOp::Null,
            8 => RelOp::Exists,
            9 => RelOp::Like,
            10 => RelOp::EqTorder,
            11 => RelOp::NullsafeEq,
            _ => return None,
        })
    }
}

/// Quantifier of an ALL/SOME term.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum QlFlag {
    Some = 0,
    All = 1,
}

/// A predicate-tree node.
pub enum PredExpr {
    Pred(Pred),
    Term(EvalTerm),
    Not(Option<PredId>),
}

pub struct Pred {
    pub lhs: Option<PredId>,
    pub rhs: Option<PredId>,
    pub bool_op: BoolOp,
}

pub enum EvalTerm {
    Comp(CompTerm),
    Alsm(AlsmTerm),
    Like(LikeTerm),
    Rlike(RlikeTerm),
}

#[derive(Clone, Copy)]
pub struct CompTerm {
    pub lhs: Option<ReguId>,
    pub rhs: Option<ReguId>,
    pub rel_op: RelOp,
}

#[derive(Clone, Copy)]
pub struct AlsmTerm {
    pub elem: Option<ReguId>,
    pub elemset: Option<ReguId>,
    pub eq_flag: QlFlag,
    pub rel_op: RelOp,
}

#[derive(Clone, Copy)]
pub struct LikeTerm {
    pub src: Option<ReguId>,
    pub pattern: Option<ReguId>,
    pub esc_char: Option<ReguId>,
}

pub struct RlikeTerm {
    pub src: Option<ReguId>,
    pub pattern: Option<ReguId>,
    pub case_sensitive: Option<ReguId>,
    /// Lazily compiled pattern, reused while the pattern text and the case
    /// mode stay unchanged. Plans are single-threaded during execution;
    /// the lock is uncontended and only orders the rare recompile.
    pub compiled: RegexCell,
}

/// The compiled-regex slot of an RLIKE term.
#[derive(Default)]
pub struct RegexCell {
    inner: Mutex<Option<CompiledRegex>>,
}

pub(crate) struct CompiledRegex {
    pub pattern: String,
    pub case_sensitive: bool,
    pub regex: regex::Regex,
}

impl RegexCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with a regex compiled for `(pattern, case_sensitive)`,
    /// compiling and caching when the cached compile does not match.
    pub(crate) fn with_compiled<R>(
        &self,
        pattern: &str,
        case_sensitive: bool,
        f: impl FnOnce(&regex::Regex) -> R,
    ) -> Result<R, regex::Error> {
        let mut slot = self.inner.lock().unwrap();
        let stale = match &*slot {
            Some(c) => c.pattern != pattern || c.case_sensitive != case_sensitive,
            None => true,
        };
        if stale {
            let built = regex::RegexBuilder::new(pattern)
                .case_insensitive(!case_sensitive)
                .build()?;
            *slot = Some(CompiledRegex {
                pattern: pattern.to_owned(),
                case_sensitive,
                regex: built,
            });
        }
        Ok(f(&slot.as_ref().unwrap().regex))
    }

    pub fn is_compiled(&self) -> bool {
        self.inner.lock().unwrap().is_some()
    }
}

bitflags::bitflags! {
    /// Flags of a regu-variable.
    pub struct ReguFlags: i32 {
        /// Does not go to the output list file.
        const HIDDEN_COLUMN = 0x01;
        /// Marks the bottom of a FIELD regu tree.
        const FIELD_COMPARE = 0x02;
        /// Child inside a FIELD tree.
        const FIELD_NESTED = 0x04;
        /// Fetches to an all-constant value.
        const FETCH_ALL_CONST = 0x20;
        /// Fetches to a non-constant value.
        const FETCH_NOT_CONST = 0x40;
    }
}

/// Attribute reference of a heap scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttrDescr {
    pub id: i32,
}

/// Column position within a tuple.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PosDescr {
    pub pos_no: i32,
}

/// A value descriptor: the tagged union of value sources the evaluator
/// fetches from.
pub enum ReguValue {
    /// Inline value.
    DbVal(ValId),
    /// Pointer to a shared value cell.
    Constant(ValId),
    /// Like `Constant`, updated by orderby_num() while building output.
    OrderByNum(ValId),
    /// Arithmetic expression evaluated into its own cell.
    InArith(ArithId),
    OutArith(ArithId),
    /// Attribute value from the attribute cache.
    Attr(AttrDescr),
    /// Column of the current tuple.
    Position(PosDescr),
    /// Sorted list file of a nested query.
    ListId(SrListId),
    /// Positional host-variable reference.
    PosValue(i32),
    /// The current object identifier.
    Oid,
    /// Function over a list of operands.
    Func(FuncId),
}

pub struct ReguVariable {
    pub flags: ReguFlags,
    /// Target the fetched value is also written into, when present.
    pub vfetch_to: Option<ValId>,
    /// Enclosing plan of this variable.
    pub xasl: Option<XaslId>,
    pub value: ReguValue,
}

/// A node of a regu-variable list.
pub struct ReguListNode {
    pub value: ReguId,
    pub next: Option<ReguListId>,
}

/// Arithmetic operators carried by plans. The expression evaluator covers
/// the numeric core; string and date functions live with the opfunc layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum ArithOp {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Mod = 4,
    UnMinus = 5,
    Abs = 6,
    IsNull = 7,
    IfNull = 8,
}

impl ArithOp {
    pub fn from_i32(v: i32) -> Option<ArithOp> {
        Some(match v {
            0 => ArithOp::Add,
            1 => ArithOp::Sub,
            2 => ArithOp::Mul,
            3 => ArithOp::Div,
            4 => ArithOp::Mod,
            5 => ArithOp::UnMinus,
            6 => ArithOp::Abs,
            7 => ArithOp::IsNull,
            8 => ArithOp::IfNull,
            _ => return None,
        })
    }
}

pub struct ArithExpr {
    /// Result cell of the subtree.
    pub value: ValId,
    pub left: Option<ReguId>,
    pub right: Option<ReguId>,
    pub third: Option<ReguId>,
    pub opcode: ArithOp,
    /// Predicate operand of T_CASE-like operators.
    pub pred: Option<PredId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum AggFunc {
    Min = 0,
    Max = 1,
    Sum = 2,
    Avg = 3,
    Count = 4,
    CountStar = 5,
}

impl AggFunc {
    pub fn from_i32(v: i32) -> Option<AggFunc> {
        Some(match v {
            0 => AggFunc::Min,
            1 => AggFunc::Max,
            2 => AggFunc::Sum,
            3 => AggFunc::Avg,
            4 => AggFunc::Count,
            5 => AggFunc::CountStar,
            _ => return None,
        })
    }
}

/// Runtime accumulator of one aggregate; zeroed at restore.
pub struct AggAccumulator {
    pub value: ValId,
    pub value2: ValId,
    pub curr_cnt: Cell<i64>,
}

pub struct AggregateExpr {
    pub next: Option<AggId>,
    pub function: AggFunc,
    pub option: QueryOptions,
    pub operand: ReguId,
    /// Sorts elements before aggregation (GROUP_CONCAT family).
    pub sort_list: Option<SortId>,
    pub acc: AggAccumulator,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum FuncType {
    /// Build a sequence from the operand values.
    Sequence = 0,
    /// ELT(n, ...): pick the n-th operand.
    Elt = 1,
}

pub struct FunctionExpr {
    pub value: ValId,
    pub operand: Option<ReguListId>,
    pub ftype: FuncType,
}

pub struct ValList {
    pub vals: Vec<ValId>,
}

pub struct OutPtrList {
    pub valptr_cnt: i32,
    pub valptrp: Option<ReguListId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum SortOrder {
    Asc = 0,
    Desc = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum SortNulls {
    First = 0,
    Last = 1,
}

pub struct SortListNode {
    pub next: Option<SortId>,
    pub pos_descr: PosDescr,
    pub s_order: SortOrder,
    pub s_nulls: SortNulls,
}

/// Descriptor of a materialized list file.
pub struct ListDescr {
    pub tuple_cnt: Cell<i64>,
}

/// A sorted list file of a nested query result.
pub struct SortedListId {
    pub sorted: Cell<bool>,
    pub list: ListDescr,
}

/// B-tree identifier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Btid {
    pub vfid: Vfid,
    pub root_pageid: PageId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum RangeType {
    /// A single key.
    Key = 0,
    /// A single range.
    Range = 1,
    /// A list of keys.
    KeyList = 2,
    /// A list of ranges.
    RangeList = 3,
}

/// Bound shape of one key range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum KeyRangeOp {
    Eq = 0,
    GeLe = 1,
    GeLt = 2,
    GtLe = 3,
    GtLt = 4,
    GeInf = 5,
    GtInf = 6,
    InfLe = 7,
    InfLt = 8,
    InfInf = 9,
}

impl KeyRangeOp {
    pub fn from_i32(v: i32) -> Option<KeyRangeOp> {
        (0..=9).contains(&v).then(|| match v {
            0 => KeyRangeOp::Eq,
            1 => KeyRangeOp::GeLe,
            2 => KeyRangeOp::GeLt,
            3 => KeyRangeOp::GtLe,
            4 => KeyRangeOp::GtLt,
            5 => KeyRangeOp::GeInf,
            6 => KeyRangeOp::GtInf,
            7 => KeyRangeOp::InfLe,
            8 => KeyRangeOp::InfLt,
            _ => KeyRangeOp::InfInf,
        })
    }
}

pub struct KeyRange {
    pub range: KeyRangeOp,
    pub key1: Option<ReguId>,
    pub key2: Option<ReguId>,
}

pub struct KeyInfo {
    pub key_ranges: Vec<KeyRange>,
    /// All range boundaries are constants; ranges need no re-evaluation
    /// between scans.
    pub is_constant: bool,
    pub key_limit_l: Option<ReguId>,
    pub key_limit_u: Option<ReguId>,
    pub key_limit_reset: bool,
}

pub struct IndxInfo {
    pub indx_id: Btid,
    pub range_type: RangeType,
    pub use_desc_index: bool,
    pub key_info: KeyInfo,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum AccessMethod {
    Sequential = 0,
    Index = 1,
}

/// Heap-scan payload of an access spec.
pub struct ClsSpec {
    pub cls_oid: Oid,
    pub hfid: Hfid,
    pub attr_ids_pred: Vec<i32>,
    pub cls_regu_list_pred: Option<ReguListId>,
    pub attr_ids_rest: Vec<i32>,
    pub cls_regu_list_rest: Option<ReguListId>,
}

/// List-scan payload of an access spec.
pub struct ListSpec {
    pub xasl_node: Option<XaslId>,
    pub list_regu_list_pred: Option<ReguListId>,
    pub list_regu_list_rest: Option<ReguListId>,
}

pub enum SpecKind {
    Class(ClsSpec),
    List(ListSpec),
}

pub struct AccessSpec {
    pub spec: SpecKind,
    pub access: AccessMethod,
    pub indx_info: Option<IndxId>,
    pub where_key: Option<PredId>,
    pub where_pred: Option<PredId>,
    /// Specialized evaluation entry for the data filter, installed at
    /// restore time.
    pub where_eval: Option<PrEvalFn>,
    /// Same, for the key filter.
    pub key_eval: Option<PrEvalFn>,
    pub next: Option<SpecId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum XaslStatus {
    Cleared = 0,
    Success = 1,
    Failure = 2,
    Initialized = 3,
}

/// Runtime statistics of one plan node; zeroed at restore.
#[derive(Default)]
pub struct XaslStats {
    pub fetched_pages: Cell<u64>,
    pub elapsed_usec: Cell<u64>,
}

pub struct UpddelClass {
    pub class_oid: Oid,
    pub class_hfid: Hfid,
    pub att_ids: Vec<i32>,
}

pub struct UpdateAssign {
    pub att_idx: i32,
    pub regu_var: Option<ReguId>,
}

pub struct UnionProc {
    pub left: Option<XaslId>,
    pub right: Option<XaslId>,
}

pub struct BuildListProc {
    pub groupby_list: Option<SortId>,
    pub g_outptr_list: Option<OutPtrId>,
    pub g_regu_list: Option<ReguListId>,
    pub g_val_list: Option<ValListId>,
    pub g_having_pred: Option<PredId>,
    pub g_grbynum_val: Option<ValId>,
    pub g_with_rollup: bool,
    pub agg_list: Option<AggId>,
}

pub struct BuildValueProc {
    pub having_pred: Option<PredId>,
    pub grbynum_val: Option<ValId>,
    pub agg_list: Option<AggId>,
    pub is_always_false: bool,
}

pub struct UpdateProc {
    pub class_info: UpddelClass,
    pub assigns: Vec<UpdateAssign>,
    pub cons_pred: Option<PredId>,
}

pub struct DeleteProc {
    pub class_info: UpddelClass,
}

pub struct InsertProc {
    pub class_oid: Oid,
    pub class_hfid: Hfid,
    pub att_ids: Vec<i32>,
    pub vals: Option<ReguListId>,
}

pub enum ProcKind {
    BuildList(BuildListProc),
    BuildValue(BuildValueProc),
    Union(UnionProc),
    Update(UpdateProc),
    Delete(DeleteProc),
    Insert(InsertProc),
}

impl ProcKind {
    pub(crate) fn tag(&self) -> i32 {
        match self {
            ProcKind::BuildList(_) => 1,
            ProcKind::BuildValue(_) => 2,
            ProcKind::Union(_) => 3,
            ProcKind::Update(_) => 4,
            ProcKind::Delete(_) => 5,
            ProcKind::Insert(_) => 6,
        }
    }
}

pub struct XaslNode {
    pub flag: i32,
    pub option: QueryOptions,
    pub dbval_cnt: i32,
    pub next: Option<XaslId>,
    pub outptr_list: Option<OutPtrId>,
    pub spec_list: Option<SpecId>,
    pub val_list: Option<ValListId>,
    pub where_pred: Option<PredId>,
    pub instnum_val: Option<ValId>,
    pub instnum_pred: Option<PredId>,
    pub proc: ProcKind,
    /// Root-only bookkeeping restored from the stream header.
    pub creator_oid: Oid,
    pub class_oid_list: Vec<Oid>,
    pub tcard_list: Vec<i32>,
    /// Server-side only; never packed.
    pub query_in_progress: Cell<bool>,
    pub status: Cell<XaslStatus>,
    pub stats: XaslStats,
}

impl XaslNode {
    /// A fresh node with runtime fields initialized the way the restorer
    /// leaves them.
    pub fn new(proc: ProcKind) -> XaslNode {
        XaslNode {
            flag: 0,
            option: QueryOptions::All,
            dbval_cnt: 0,
            next: None,
            outptr_list: None,
            spec_list: None,
            val_list: None,
            where_pred: None,
            instnum_val: None,
            instnum_pred: None,
            proc,
            creator_oid: Oid::NULL,
            class_oid_list: Vec::new(),
            tcard_list: Vec::new(),
            query_in_progress: Cell::new(false),
            status: Cell::new(XaslStatus::Initialized),
            stats: XaslStats::default(),
        }
    }
}

macro_rules! arena_store {
    ($store:ident, $handle:ident, $node:ty, $alloc:ident, $get:ident, $get_mut:ident) => {
        pub fn $alloc(&mut self, node: $node) -> $handle {
            let id = $handle(self.$store.len() as u32);
            self.$store.push(node);
            id
        }

        pub fn $get(&self, id: $handle) -> &$node {
            &self.$store[id.index()]
        }

        pub fn $get_mut(&mut self, id: $handle) -> &mut $node {
            &mut self.$store[id.index()]
        }
    };
}

/// The plan arena: every node of a plan graph, owned together.
#[derive(Default)]
pub struct PlanArena {
    xasls: Vec<XaslNode>,
    preds: Vec<PredExpr>,
    regus: Vec<ReguVariable>,
    regu_lists: Vec<ReguListNode>,
    ariths: Vec<ArithExpr>,
    aggs: Vec<AggregateExpr>,
    funcs: Vec<FunctionExpr>,
    values: Vec<RefCell<DbValue>>,
    specs: Vec<AccessSpec>,
    indxs: Vec<IndxInfo>,
    sorts: Vec<SortListNode>,
    srlists: Vec<SortedListId>,
    val_lists: Vec<ValList>,
    outptrs: Vec<OutPtrList>,
}

impl PlanArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// An arena with capacity proportional to the packed stream size, so
    /// a restore allocates its backing stores once.
    pub fn with_stream_size(stream_len: usize) -> Self {
        // A node costs at least a handful of stream bytes; scaling the
        // biggest stores by the stream length keeps reallocation out of
        // the restore path.
        let guess = stream_len / 16 + 8;
        PlanArena {
            regus: Vec::with_capacity(guess),
            values: Vec::with_capacity(guess),
            preds: Vec::with_capacity(guess / 2),
            ..Default::default()
        }
    }

    arena_store!(xasls, XaslId, XaslNode, alloc_xasl, xasl, xasl_mut);
    arena_store!(preds, PredId, PredExpr, alloc_pred, pred, pred_mut);
    arena_store!(regus, ReguId, ReguVariable, alloc_regu, regu, regu_mut);
    arena_store!(
        regu_lists,
        ReguListId,
        ReguListNode,
        alloc_regu_list,
        regu_list,
        regu_list_mut
    );
    arena_store!(ariths, ArithId, ArithExpr, alloc_arith, arith, arith_mut);
    arena_store!(aggs, AggId, AggregateExpr, alloc_agg, agg, agg_mut);
    arena_store!(funcs, FuncId, FunctionExpr, alloc_func, func, func_mut);
    arena_store!(specs, SpecId, AccessSpec, alloc_spec, spec, spec_mut);
    arena_store!(indxs, IndxId, IndxInfo, alloc_indx, indx, indx_mut);
    arena_store!(sorts, SortId, SortListNode, alloc_sort, sort, sort_mut);
    arena_store!(
        srlists,
        SrListId,
        SortedListId,
        alloc_srlist,
        srlist,
        srlist_mut
    );
    arena_store!(
        val_lists,
        ValListId,
        ValList,
        alloc_val_list,
        val_list,
        val_list_mut
    );
    arena_store!(
        outptrs,
        OutPtrId,
        OutPtrList,
        alloc_outptr,
        outptr,
        outptr_mut
    );

    pub fn alloc_value(&mut self, value: DbValue) -> ValId {
        let id = ValId(self.values.len() as u32);
        self.values.push(RefCell::new(value));
        id
    }

    pub fn value(&self, id: ValId) -> std::cell::Ref<'_, DbValue> {
        self.values[id.index()].borrow()
    }

    pub fn value_clone(&self, id: ValId) -> DbValue {
        self.values[id.index()].borrow().clone()
    }

    pub fn set_value(&self, id: ValId, value: DbValue) {
        *self.values[id.index()].borrow_mut() = value;
    }

    /// Walk a regu-variable list into a vector of its regu handles.
    pub fn regu_list_items(&self, head: Option<ReguListId>) -> Vec<ReguId> {
        let mut items = Vec::new();
        let mut cur = head;
        while let Some(id) = cur {
            let node = self.regu_list(id);
            items.push(node.value);
            cur = node.next;
        }
        items
    }
}

/// A plan restored from a stream: the arena plus the root node.
pub struct RestoredPlan {
    pub arena: PlanArena,
    pub root: XaslId,
    pub version: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_share_nodes() {
        let mut arena = PlanArena::new();
        let v = arena.alloc_value(DbValue::Int(1));
        let regu = arena.alloc_regu(ReguVariable {
            flags: ReguFlags::empty(),
            vfetch_to: None,
            xasl: None,
            value: ReguValue::Constant(v),
        });
        let a = arena.alloc_regu_list(ReguListNode {
            value: regu,
            next: None,
        });
        let b = a;
        // Updates through one handle are visible through the other.
        let tail = arena.alloc_regu_list(ReguListNode {
            value: regu,
            next: None,
        });
        arena.regu_list_mut(a).next = Some(tail);
        assert_eq!(arena.regu_list(b).next, Some(tail));
    }

    #[test]
    fn value_cells_update_through_shared_refs() {
        let mut arena = PlanArena::new();
        let v = arena.alloc_value(DbValue::Null);
        arena.set_value(v, DbValue::Int(9));
        assert_eq!(arena.value_clone(v), DbValue::Int(9));
    }

    #[test]
    fn regex_cell_compiles_once_per_pattern() {
        let cell = RegexCell::new();
        assert!(!cell.is_compiled());
        let hit = cell
            .with_compiled("^a.*b$", true, |re| re.is_match("axxb"))
            .unwrap();
        assert!(hit);
        assert!(cell.is_compiled());
        // Same pattern: reuse; different case mode: recompile.
        let hit = cell
            .with_compiled("^a.*b$", false, |re| re.is_match("AXB"))
            .unwrap();
        assert!(hit);
    }
}
