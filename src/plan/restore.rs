//! Restore a packed plan stream into a live node graph.
//!
//! The stream is `[4B header size][header][4B body size][body]`, integers
//! big-endian, the body aligned to a machine word. Every pointer in the
//! body is a byte offset from the body start; offset zero restores to a
//! null reference. A visited table keyed on the source offset resolves
//! shared substructures and cycles to a single arena node: the handle is
//! recorded before the node's fields are populated, so a cycle closes on
//! the handle already in the table.

use std::collections::HashMap;

use byteorder::{BigEndian, ByteOrder};
use xxhash_rust::xxh3::Xxh3Builder;

use crate::error::PlanError;
use crate::eval::eval_fnc;
use crate::types::{Hfid, Oid, Vfid};
use crate::value::DbValue;

use super::*;

/// Stream format version.
pub const STREAM_VERSION: i32 = 1;

/// Alignment of the stream body and of packed nodes.
pub(crate) const STREAM_ALIGN: usize = 8;

pub(crate) fn make_align(n: usize) -> usize {
    (n + STREAM_ALIGN - 1) & !(STREAM_ALIGN - 1)
}

/// A checked read cursor over the stream body.
struct Cursor<'a> {
    body: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn at(body: &'a [u8], off: u32) -> Result<Cursor<'a>, PlanError> {
        if off as usize >= body.len() {
            return Err(PlanError::OffsetOutOfRange {
                offset: off,
                body_size: body.len() as u32,
            });
        }
        Ok(Cursor {
            body,
            pos: off as usize,
        })
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PlanError> {
        if self.pos + n > self.body.len() {
            return Err(PlanError::InvalidXaslNode("truncated stream"));
        }
        let s = &self.body[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn read_i32(&mut self) -> Result<i32, PlanError> {
        Ok(BigEndian::read_i32(self.take(4)?))
    }

    fn read_i64(&mut self) -> Result<i64, PlanError> {
        Ok(BigEndian::read_i64(self.take(8)?))
    }

    fn read_f64(&mut self) -> Result<f64, PlanError> {
        Ok(f64::from_bits(BigEndian::read_u64(self.take(8)?)))
    }

    fn read_bool(&mut self) -> Result<bool, PlanError> {
        Ok(self.read_i32()? != 0)
    }

    /// An offset field: zero restores to a null reference; anything else
    /// must land inside the body.
    fn read_offset(&mut self) -> Result<Option<u32>, PlanError> {
        let v = self.read_i32()?;
        if v == 0 {
            return Ok(None);
        }
        if v < 0 || v as usize >= self.body.len() {
            return Err(PlanError::OffsetOutOfRange {
                offset: v as u32,
                body_size: self.body.len() as u32,
            });
        }
        Ok(Some(v as u32))
    }

    fn read_oid(&mut self) -> Result<Oid, PlanError> {
        let volid = self.read_i32()? as i16;
        let pageid = self.read_i32()?;
        let slotid = self.read_i32()? as i16;
        Ok(Oid {
            volid,
            pageid,
            slotid,
        })
    }

    fn read_hfid(&mut self) -> Result<Hfid, PlanError> {
        let volid = self.read_i32()? as i16;
        let fileid = self.read_i32()?;
        let hpgid = self.read_i32()?;
        Ok(Hfid {
            vfid: Vfid { volid, fileid },
            hpgid,
        })
    }

    fn read_int_array(&mut self) -> Result<Vec<i32>, PlanError> {
        let n = self.read_i32()?;
        if n < 0 {
            return Err(PlanError::InvalidXaslNode("negative array length"));
        }
        (0..n).map(|_| self.read_i32()).collect()
    }

    fn read_string(&mut self) -> Result<String, PlanError> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(PlanError::InvalidXaslNode("negative string length"));
        }
        let bytes = self.take(len as usize)?.to_vec();
        let pad = (4 - (len as usize % 4)) % 4;
        self.take(pad)?;
        String::from_utf8(bytes).map_err(|_| PlanError::InvalidXaslNode("bad string encoding"))
    }
}

/// What a visited offset restored to.
#[derive(Clone, Copy)]
enum Visited {
    Xasl(XaslId),
    Pred(PredId),
    Regu(ReguId),
    ReguList(ReguListId),
    Arith(ArithId),
    Agg(AggId),
    Func(FuncId),
    Val(ValId),
    Spec(SpecId),
    Indx(IndxId),
    Sort(SortId),
    SrList(SrListId),
    ValList(ValListId),
    OutPtr(OutPtrId),
}

const TYPE_CONFUSION: PlanError =
    PlanError::InvalidXaslNode("offset restored as two different node kinds");

struct Restorer<'a> {
    body: &'a [u8],
    arena: PlanArena,
    visited: HashMap<u32, Visited, Xxh3Builder>,
}

macro_rules! restore_entry {
    ($fn_name:ident, $build:ident, $variant:ident, $id:ty, $alloc:ident, $placeholder:expr) => {
        fn $fn_name(&mut self, off: u32) -> Result<$id, PlanError> {
            if let Some(v) = self.visited.get(&off) {
                return match v {
                    Visited::$variant(id) => Ok(*id),
                    _ => Err(TYPE_CONFUSION),
                };
            }
            let id = self.arena.$alloc($placeholder);
            self.visited.insert(off, Visited::$variant(id));
            let mut c = Cursor::at(self.body, off)?;
            self.$build(&mut c, id)?;
            Ok(id)
        }
    };
}

impl<'a> Restorer<'a> {
    fn new(body: &'a [u8], stream_len: usize) -> Self {
        Self {
            body,
            arena: PlanArena::with_stream_size(stream_len),
            visited: HashMap::with_hasher(Xxh3Builder::new()),
        }
    }

    restore_entry!(
        restore_xasl,
        build_xasl,
        Xasl,
        XaslId,
        alloc_xasl,
        XaslNode::new(ProcKind::Union(UnionProc {
            left: None,
            right: None,
        }))
    );

    restore_entry!(
        restore_pred,
        build_pred_expr_at,
        Pred,
        PredId,
        alloc_pred,
        PredExpr::Not(None)
    );

    restore_entry!(
        restore_regu,
        build_regu_at,
        Regu,
        ReguId,
        alloc_regu,
        ReguVariable {
            flags: ReguFlags::empty(),
            vfetch_to: None,
            xasl: None,
            value: ReguValue::Oid,
        }
    );

    restore_entry!(
        restore_arith,
        build_arith_at,
        Arith,
        ArithId,
        alloc_arith,
        ArithExpr {
            value: ValId(0),
            left: None,
            right: None,
            third: None,
            opcode: ArithOp::Add,
            pred: None,
        }
    );

    restore_entry!(
        restore_agg,
        build_agg_at,
        Agg,
        AggId,
        alloc_agg,
        AggregateExpr {
            next: None,
            function: AggFunc::Count,
            option: QueryOptions::All,
            operand: ReguId(0),
            sort_list: None,
            acc: AggAccumulator {
                value: ValId(0),
                value2: ValId(0),
                curr_cnt: std::cell::Cell::new(0),
            },
        }
    );

    restore_entry!(
        restore_func,
        build_func_at,
        Func,
        FuncId,
        alloc_func,
        FunctionExpr {
            value: ValId(0),
            operand: None,
            ftype: FuncType::Sequence,
        }
    );

    restore_entry!(
        restore_spec,
        build_spec_at,
        Spec,
        SpecId,
        alloc_spec,
        AccessSpec {
            spec: SpecKind::List(ListSpec {
                xasl_node: None,
                list_regu_list_pred: None,
                list_regu_list_rest: None,
            }),
            access: AccessMethod::Sequential,
            indx_info: None,
            where_key: None,
            where_pred: None,
            where_eval: None,
            key_eval: None,
            next: None,
        }
    );

    restore_entry!(
        restore_indx,
        build_indx_at,
        Indx,
        IndxId,
        alloc_indx,
        IndxInfo {
            indx_id: Btid::default(),
            range_type: RangeType::Key,
            use_desc_index: false,
            key_info: KeyInfo {
                key_ranges: Vec::new(),
                is_constant: false,
                key_limit_l: None,
                key_limit_u: None,
                key_limit_reset: false,
            },
        }
    );

    fn restore_value(&mut self, off: u32) -> Result<ValId, PlanError> {
        if let Some(v) = self.visited.get(&off) {
            return match v {
                Visited::Val(id) => Ok(*id),
                _ => Err(TYPE_CONFUSION),
            };
        }
        let id = self.arena.alloc_value(DbValue::Null);
        self.visited.insert(off, Visited::Val(id));
        let mut c = Cursor::at(self.body, off)?;
        let value = self.read_db_value(&mut c)?;
        self.arena.set_value(id, value);
        Ok(id)
    }

    fn restore_srlist(&mut self, off: u32) -> Result<SrListId, PlanError> {
        if let Some(v) = self.visited.get(&off) {
            return match v {
                Visited::SrList(id) => Ok(*id),
                _ => Err(TYPE_CONFUSION),
            };
        }
        let mut c = Cursor::at(self.body, off)?;
        let sorted = c.read_bool()?;
        let tuple_cnt = c.read_i64()?;
        let id = self.arena.alloc_srlist(SortedListId {
            sorted: std::cell::Cell::new(sorted),
            list: ListDescr {
                tuple_cnt: std::cell::Cell::new(tuple_cnt),
            },
        });
        self.visited.insert(off, Visited::SrList(id));
        Ok(id)
    }

    fn restore_val_list(&mut self, off: u32) -> Result<ValListId, PlanError> {
        if let Some(v) = self.visited.get(&off) {
            return match v {
                Visited::ValList(id) => Ok(*id),
                _ => Err(TYPE_CONFUSION),
            };
        }
        let id = self.arena.alloc_val_list(ValList { vals: Vec::new() });
        self.visited.insert(off, Visited::ValList(id));
        let mut c = Cursor::at(self.body, off)?;
        let n = c.read_i32()?;
        if n < 0 {
            return Err(PlanError::InvalidXaslNode("negative value-list length"));
        }
        let mut vals = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let voff = c
                .read_offset()?
                .ok_or(PlanError::InvalidXaslNode("null value in value list"))?;
            vals.push(self.restore_value(voff)?);
        }
        self.arena.val_list_mut(id).vals = vals;
        Ok(id)
    }

    fn restore_outptr(&mut self, off: u32) -> Result<OutPtrId, PlanError> {
        if let Some(v) = self.visited.get(&off) {
            return match v {
                Visited::OutPtr(id) => Ok(*id),
                _ => Err(TYPE_CONFUSION),
            };
        }
        let id = self.arena.alloc_outptr(OutPtrList {
            valptr_cnt: 0,
            valptrp: None,
        });
        self.visited.insert(off, Visited::OutPtr(id));
        let mut c = Cursor::at(self.body, off)?;
        let cnt = c.read_i32()?;
        let head = match c.read_offset()? {
            Some(o) => Some(self.restore_regu_list(o)?),
            None => None,
        };
        let out = self.arena.outptr_mut(id);
        out.valptr_cnt = cnt;
        out.valptrp = head;
        Ok(id)
    }

    /// A regu-variable list is a counted sequence of inline variables,
    /// restored into a chain of nodes. The chain skeleton is allocated
    /// and linked before any variable is built, so that a cycle through a
    /// nested plan finds the list already in the visited table.
    fn restore_regu_list(&mut self, off: u32) -> Result<ReguListId, PlanError> {
        if let Some(v) = self.visited.get(&off) {
            return match v {
                Visited::ReguList(id) => Ok(*id),
                _ => Err(TYPE_CONFUSION),
            };
        }
        let mut c = Cursor::at(self.body, off)?;
        let count = c.read_i32()?;
        if count <= 0 {
            return Err(PlanError::InvalidXaslNode("empty regu-variable list"));
        }

        let regu_ids: Vec<ReguId> = (0..count)
            .map(|_| {
                self.arena.alloc_regu(ReguVariable {
                    flags: ReguFlags::empty(),
                    vfetch_to: None,
                    xasl: None,
                    value: ReguValue::Oid,
                })
            })
            .collect();
        let mut next = None;
        for &regu in regu_ids.iter().rev() {
            let node = self.arena.alloc_regu_list(ReguListNode { value: regu, next });
            next = Some(node);
        }
        let head = next.expect("count checked above");
        self.visited.insert(off, Visited::ReguList(head));

        for &regu in regu_ids.iter() {
            let built = self.build_regu(&mut c)?;
            *self.arena.regu_mut(regu) = built;
        }
        Ok(head)
    }

    fn restore_sort_list(&mut self, off: u32) -> Result<SortId, PlanError> {
        if let Some(v) = self.visited.get(&off) {
            return match v {
                Visited::Sort(id) => Ok(*id),
                _ => Err(TYPE_CONFUSION),
            };
        }
        let mut c = Cursor::at(self.body, off)?;
        let count = c.read_i32()?;
        if count <= 0 {
            return Err(PlanError::InvalidXaslNode("empty sort list"));
        }
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let pos_no = c.read_i32()?;
            let s_order = match c.read_i32()? {
                0 => SortOrder::Asc,
                1 => SortOrder::Desc,
                _ => return Err(PlanError::InvalidXaslNode("bad sort order")),
            };
            let s_nulls = match c.read_i32()? {
                0 => SortNulls::First,
                1 => SortNulls::Last,
                _ => return Err(PlanError::InvalidXaslNode("bad nulls order")),
            };
            items.push((pos_no, s_order, s_nulls));
        }
        let mut next = None;
        for &(pos_no, s_order, s_nulls) in items.iter().rev() {
            let id = self.arena.alloc_sort(SortListNode {
                next,
                pos_descr: PosDescr { pos_no },
                s_order,
                s_nulls,
            });
            next = Some(id);
        }
        let head = next.expect("count checked above");
        self.visited.insert(off, Visited::Sort(head));
        Ok(head)
    }

    // -----------------------------------------------------------------
    // Builders
    // -----------------------------------------------------------------

    fn opt_xasl(&mut self, c: &mut Cursor<'_>) -> Result<Option<XaslId>, PlanError> {
        c.read_offset()?.map(|o| self.restore_xasl(o)).transpose()
    }

    fn opt_pred(&mut self, c: &mut Cursor<'_>) -> Result<Option<PredId>, PlanError> {
        c.read_offset()?.map(|o| self.restore_pred(o)).transpose()
    }

    fn opt_regu(&mut self, c: &mut Cursor<'_>) -> Result<Option<ReguId>, PlanError> {
        c.read_offset()?.map(|o| self.restore_regu(o)).transpose()
    }

    fn opt_regu_list(&mut self, c: &mut Cursor<'_>) -> Result<Option<ReguListId>, PlanError> {
        c.read_offset()?
            .map(|o| self.restore_regu_list(o))
            .transpose()
    }

    fn opt_value(&mut self, c: &mut Cursor<'_>) -> Result<Option<ValId>, PlanError> {
        c.read_offset()?.map(|o| self.restore_value(o)).transpose()
    }

    fn build_xasl(&mut self, c: &mut Cursor<'_>, id: XaslId) -> Result<(), PlanError> {
        let proc_tag = c.read_i32()?;
        let flag = c.read_i32()?;
        let option = match c.read_i32()? {
            0 => QueryOptions::Distinct,
            1 => QueryOptions::All,
            _ => return Err(PlanError::InvalidXaslNode("bad query option")),
        };
        let dbval_cnt = c.read_i32()?;
        let next = self.opt_xasl(c)?;
        let outptr_list = match c.read_offset()? {
            Some(o) => Some(self.restore_outptr(o)?),
            None => None,
        };
        let spec_list = match c.read_offset()? {
            Some(o) => Some(self.restore_spec(o)?),
            None => None,
        };
        let val_list = match c.read_offset()? {
            Some(o) => Some(self.restore_val_list(o)?),
            None => None,
        };
        let where_pred = self.opt_pred(c)?;
        let instnum_val = self.opt_value(c)?;
        let instnum_pred = self.opt_pred(c)?;

        let proc = match proc_tag {
            1 => ProcKind::BuildList(BuildListProc {
                groupby_list: match c.read_offset()? {
                    Some(o) => Some(self.restore_sort_list(o)?),
                    None => None,
                },
                g_outptr_list: match c.read_offset()? {
                    Some(o) => Some(self.restore_outptr(o)?),
                    None => None,
                },
                g_regu_list: self.opt_regu_list(c)?,
                g_val_list: match c.read_offset()? {
                    Some(o) => Some(self.restore_val_list(o)?),
                    None => None,
                },
                g_having_pred: self.opt_pred(c)?,
                g_grbynum_val: self.opt_value(c)?,
                g_with_rollup: c.read_bool()?,
                agg_list: match c.read_offset()? {
                    Some(o) => Some(self.restore_agg(o)?),
                    None => None,
                },
            }),
            2 => ProcKind::BuildValue(BuildValueProc {
                having_pred: self.opt_pred(c)?,
                grbynum_val: self.opt_value(c)?,
                agg_list: match c.read_offset()? {
                    Some(o) => Some(self.restore_agg(o)?),
                    None => None,
                },
                is_always_false: c.read_bool()?,
            }),
            3 => ProcKind::Union(UnionProc {
                left: self.opt_xasl(c)?,
                right: self.opt_xasl(c)?,
            }),
            4 => {
                let class_info = self.read_upddel_class(c)?;
                let n_assigns = c.read_i32()?;
                if n_assigns < 0 {
                    return Err(PlanError::InvalidXaslNode("negative assignment count"));
                }
                let mut assigns = Vec::with_capacity(n_assigns as usize);
                for _ in 0..n_assigns {
                    let att_idx = c.read_i32()?;
                    let regu_var = self.opt_regu(c)?;
                    assigns.push(UpdateAssign { att_idx, regu_var });
                }
                ProcKind::Update(UpdateProc {
                    class_info,
                    assigns,
                    cons_pred: self.opt_pred(c)?,
                })
            }
            5 => ProcKind::Delete(DeleteProc {
                class_info: self.read_upddel_class(c)?,
            }),
            6 => ProcKind::Insert(InsertProc {
                class_oid: c.read_oid()?,
                class_hfid: c.read_hfid()?,
                att_ids: c.read_int_array()?,
                vals: self.opt_regu_list(c)?,
            }),
            _ => return Err(PlanError::InvalidXaslNode("unknown proc tag")),
        };

        let node = self.arena.xasl_mut(id);
        node.flag = flag;
        node.option = option;
        node.dbval_cnt = dbval_cnt;
        node.next = next;
        node.outptr_list = outptr_list;
        node.spec_list = spec_list;
        node.val_list = val_list;
        node.where_pred = where_pred;
        node.instnum_val = instnum_val;
        node.instnum_pred = instnum_pred;
        node.proc = proc;
        Ok(())
    }

    fn read_upddel_class(&mut self, c: &mut Cursor<'_>) -> Result<UpddelClass, PlanError> {
        Ok(UpddelClass {
            class_oid: c.read_oid()?,
            class_hfid: c.read_hfid()?,
            att_ids: c.read_int_array()?,
        })
    }

    fn build_pred_expr_at(&mut self, c: &mut Cursor<'_>, id: PredId) -> Result<(), PlanError> {
        let pred = self.build_pred_expr(c)?;
        *self.arena.pred_mut(id) = pred;
        Ok(())
    }

    fn build_pred_expr(&mut self, c: &mut Cursor<'_>) -> Result<PredExpr, PlanError> {
        match c.read_i32()? {
            1 => Ok(PredExpr::Pred(self.build_pred(c)?)),
            2 => Ok(PredExpr::Term(self.build_eval_term(c)?)),
            3 => Ok(PredExpr::Not(self.opt_pred(c)?)),
            _ => Err(PlanError::InvalidXaslNode("unknown predicate tag")),
        }
    }

    /// Right-linear AND/OR chains are packed flat: `[lhs][op]` repeats
    /// while the chain marker reads 1, then the final rhs reference.
    fn build_pred(&mut self, c: &mut Cursor<'_>) -> Result<Pred, PlanError> {
        let mut segs: Vec<(Option<PredId>, BoolOp)> = Vec::new();
        loop {
            let lhs = self.opt_pred(c)?;
            let bool_op = read_bool_op(c)?;
            segs.push((lhs, bool_op));
            if c.read_i32()? != 1 {
                break;
            }
        }
        let final_rhs = self.opt_pred(c)?;

        let mut rhs = final_rhs;
        for (lhs, bool_op) in segs.drain(1..).rev() {
            let node = self
                .arena
                .alloc_pred(PredExpr::Pred(Pred { lhs, rhs, bool_op }));
            rhs = Some(node);
        }
        let (lhs, bool_op) = segs.pop().expect("at least one segment");
        Ok(Pred { lhs, rhs, bool_op })
    }

    fn build_eval_term(&mut self, c: &mut Cursor<'_>) -> Result<EvalTerm, PlanError> {
        match c.read_i32()? {
            1 => Ok(EvalTerm::Comp(CompTerm {
                lhs: self.opt_regu(c)?,
                rhs: self.opt_regu(c)?,
                rel_op: read_rel_op(c)?,
            })),
            2 => Ok(EvalTerm::Alsm(AlsmTerm {
                elem: self.opt_regu(c)?,
                elemset: self.opt_regu(c)?,
                eq_flag: match c.read_i32()? {
                    0 => QlFlag::Some,
                    1 => QlFlag::All,
                    _ => return Err(PlanError::InvalidXaslNode("bad quantifier")),
                },
                rel_op: read_rel_op(c)?,
            })),
            3 => Ok(EvalTerm::Like(LikeTerm {
                src: self.opt_regu(c)?,
                pattern: self.opt_regu(c)?,
                esc_char: self.opt_regu(c)?,
            })),
            4 => Ok(EvalTerm::Rlike(RlikeTerm {
                src: self.opt_regu(c)?,
                pattern: self.opt_regu(c)?,
                case_sensitive: self.opt_regu(c)?,
                // Compiled-pattern state starts empty after a restore.
                compiled: RegexCell::new(),
            })),
            _ => Err(PlanError::InvalidXaslNode("unknown eval-term tag")),
        }
    }

    fn build_regu_at(&mut self, c: &mut Cursor<'_>, id: ReguId) -> Result<(), PlanError> {
        let regu = self.build_regu(c)?;
        *self.arena.regu_mut(id) = regu;
        Ok(())
    }

    fn build_regu(&mut self, c: &mut Cursor<'_>) -> Result<ReguVariable, PlanError> {
        let tag = c.read_i32()?;
        let flags = ReguFlags::from_bits_truncate(c.read_i32()?);
        let vfetch_to = self.opt_value(c)?;
        let xasl = self.opt_xasl(c)?;
        let value = match tag {
            0 => {
                let v = self.read_db_value(c)?;
                ReguValue::DbVal(self.arena.alloc_value(v))
            }
            1 | 2 => {
                let off = c
                    .read_offset()?
                    .ok_or(PlanError::InvalidXaslNode("null constant reference"))?;
                let val = self.restore_value(off)?;
                if tag == 1 {
                    ReguValue::Constant(val)
                } else {
                    ReguValue::OrderByNum(val)
                }
            }
            3 | 4 => {
                let off = c
                    .read_offset()?
                    .ok_or(PlanError::InvalidXaslNode("null arithmetic reference"))?;
                let arith = self.restore_arith(off)?;
                if tag == 3 {
                    ReguValue::InArith(arith)
                } else {
                    ReguValue::OutArith(arith)
                }
            }
            5 => ReguValue::Attr(AttrDescr { id: c.read_i32()? }),
            6 => ReguValue::Position(PosDescr {
                pos_no: c.read_i32()?,
            }),
            7 => {
                let off = c
                    .read_offset()?
                    .ok_or(PlanError::InvalidXaslNode("null list-id reference"))?;
                ReguValue::ListId(self.restore_srlist(off)?)
            }
            8 => ReguValue::PosValue(c.read_i32()?),
            9 => ReguValue::Oid,
            10 => {
                let off = c
                    .read_offset()?
                    .ok_or(PlanError::InvalidXaslNode("null function reference"))?;
                ReguValue::Func(self.restore_func(off)?)
            }
            _ => return Err(PlanError::InvalidXaslNode("unknown regu-variable tag")),
        };
        Ok(ReguVariable {
            flags,
            vfetch_to,
            xasl,
            value,
        })
    }

    fn read_db_value(&mut self, c: &mut Cursor<'_>) -> Result<DbValue, PlanError> {
        Ok(match c.read_i32()? {
            0 => DbValue::Null,
            1 => DbValue::Int(c.read_i32()?),
            2 => DbValue::Bigint(c.read_i64()?),
            3 => DbValue::Double(c.read_f64()?),
            4 => DbValue::Varchar(c.read_string()?),
            5 => {
                let n = c.read_i32()?;
                if n < 0 {
                    return Err(PlanError::InvalidXaslNode("negative sequence length"));
                }
                let mut seq = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    seq.push(self.read_db_value(c)?);
                }
                DbValue::Sequence(seq)
            }
            6 => DbValue::Oid(c.read_oid()?),
            _ => return Err(PlanError::InvalidXaslNode("unknown value tag")),
        })
    }

    fn build_arith_at(&mut self, c: &mut Cursor<'_>, id: ArithId) -> Result<(), PlanError> {
        let opcode = ArithOp::from_i32(c.read_i32()?)
            .ok_or(PlanError::InvalidXaslNode("unknown arithmetic operator"))?;
        let value = match c.read_offset()? {
            Some(o) => self.restore_value(o)?,
            None => self.arena.alloc_value(DbValue::Null),
        };
        let left = self.opt_regu(c)?;
        let right = self.opt_regu(c)?;
        let third = self.opt_regu(c)?;
        let pred = self.opt_pred(c)?;
        *self.arena.arith_mut(id) = ArithExpr {
            value,
            left,
            right,
            third,
            opcode,
            pred,
        };
        Ok(())
    }

    fn build_agg_at(&mut self, c: &mut Cursor<'_>, id: AggId) -> Result<(), PlanError> {
        let next = match c.read_offset()? {
            Some(o) => Some(self.restore_agg(o)?),
            None => None,
        };
        let function = AggFunc::from_i32(c.read_i32()?)
            .ok_or(PlanError::InvalidXaslNode("unknown aggregate function"))?;
        let option = match c.read_i32()? {
            0 => QueryOptions::Distinct,
            1 => QueryOptions::All,
            _ => return Err(PlanError::InvalidXaslNode("bad aggregate option")),
        };
        let operand = {
            let built = self.build_regu(c)?;
            self.arena.alloc_regu(built)
        };
        let sort_list = match c.read_offset()? {
            Some(o) => Some(self.restore_sort_list(o)?),
            None => None,
        };
        // The accumulator is runtime state: fresh cells, zero count.
        let acc = AggAccumulator {
            value: self.arena.alloc_value(DbValue::Null),
            value2: self.arena.alloc_value(DbValue::Null),
            curr_cnt: std::cell::Cell::new(0),
        };
        *self.arena.agg_mut(id) = AggregateExpr {
            next,
            function,
            option,
            operand,
            sort_list,
            acc,
        };
        Ok(())
    }

    fn build_func_at(&mut self, c: &mut Cursor<'_>, id: FuncId) -> Result<(), PlanError> {
        let ftype = match c.read_i32()? {
            0 => FuncType::Sequence,
            1 => FuncType::Elt,
            _ => return Err(PlanError::InvalidXaslNode("unknown function type")),
        };
        let operand = self.opt_regu_list(c)?;
        let value = self.arena.alloc_value(DbValue::Null);
        *self.arena.func_mut(id) = FunctionExpr {
            value,
            operand,
            ftype,
        };
        Ok(())
    }

    fn build_spec_at(&mut self, c: &mut Cursor<'_>, id: SpecId) -> Result<(), PlanError> {
        let kind_tag = c.read_i32()?;
        let access = match c.read_i32()? {
            0 => AccessMethod::Sequential,
            1 => AccessMethod::Index,
            _ => return Err(PlanError::InvalidXaslNode("bad access method")),
        };
        let indx_info = match c.read_offset()? {
            Some(o) => Some(self.restore_indx(o)?),
            None => None,
        };
        let where_key = self.opt_pred(c)?;
        let where_pred = self.opt_pred(c)?;
        let spec = match kind_tag {
            0 => SpecKind::Class(ClsSpec {
                cls_oid: c.read_oid()?,
                hfid: c.read_hfid()?,
                attr_ids_pred: c.read_int_array()?,
                cls_regu_list_pred: self.opt_regu_list(c)?,
                attr_ids_rest: c.read_int_array()?,
                cls_regu_list_rest: self.opt_regu_list(c)?,
            }),
            1 => SpecKind::List(ListSpec {
                xasl_node: self.opt_xasl(c)?,
                list_regu_list_pred: self.opt_regu_list(c)?,
                list_regu_list_rest: self.opt_regu_list(c)?,
            }),
            _ => return Err(PlanError::InvalidXaslNode("unknown access-spec kind")),
        };
        let next = match c.read_offset()? {
            Some(o) => Some(self.restore_spec(o)?),
            None => None,
        };

        // Single-term filters get their specialized evaluation functions
        // here, so scans start with the dispatch already decided.
        let where_eval = where_pred.map(|p| eval_fnc(&self.arena, p));
        let key_eval = where_key.map(|p| eval_fnc(&self.arena, p));

        *self.arena.spec_mut(id) = AccessSpec {
            spec,
            access,
            indx_info,
            where_key,
            where_pred,
            where_eval,
            key_eval,
            next,
        };
        Ok(())
    }

    fn build_indx_at(&mut self, c: &mut Cursor<'_>, id: IndxId) -> Result<(), PlanError> {
        let indx_id = Btid {
            vfid: Vfid {
                volid: c.read_i32()? as i16,
                fileid: c.read_i32()?,
            },
            root_pageid: c.read_i32()?,
        };
        let range_type = match c.read_i32()? {
            0 => RangeType::Key,
            1 => RangeType::Range,
            2 => RangeType::KeyList,
            3 => RangeType::RangeList,
            _ => return Err(PlanError::InvalidXaslNode("bad range type")),
        };
        let use_desc_index = c.read_bool()?;
        let key_cnt = c.read_i32()?;
        if key_cnt < 0 {
            return Err(PlanError::InvalidXaslNode("negative key-range count"));
        }
        let mut key_ranges = Vec::with_capacity(key_cnt as usize);
        for _ in 0..key_cnt {
            let range = KeyRangeOp::from_i32(c.read_i32()?)
                .ok_or(PlanError::InvalidXaslNode("bad key-range operator"))?;
            let key1 = self.opt_regu(c)?;
            let key2 = self.opt_regu(c)?;
            key_ranges.push(KeyRange { range, key1, key2 });
        }
        let is_constant = c.read_bool()?;
        let key_limit_l = self.opt_regu(c)?;
        let key_limit_u = self.opt_regu(c)?;
        let key_limit_reset = c.read_bool()?;
        *self.arena.indx_mut(id) = IndxInfo {
            indx_id,
            range_type,
            use_desc_index,
            key_info: KeyInfo {
                key_ranges,
                is_constant,
                key_limit_l,
                key_limit_u,
                key_limit_reset,
            },
        };
        Ok(())
    }
}

fn read_bool_op(c: &mut Cursor<'_>) -> Result<BoolOp, PlanError> {
    Ok(match c.read_i32()? {
        1 => BoolOp::And,
        2 => BoolOp::Or,
        3 => BoolOp::Xor,
        4 => BoolOp::Is,
        5 => BoolOp::IsNot,
        _ => return Err(PlanError::InvalidXaslNode("unknown Boolean connective")),
    })
}

fn read_rel_op(c: &mut Cursor<'_>) -> Result<RelOp, PlanError> {
    RelOp::from_i32(c.read_i32()?)
        .ok_or(PlanError::InvalidXaslNode("unknown relational operator"))
}

/// Restore a packed plan stream into a live plan graph.
pub fn restore_plan(stream: &[u8]) -> Result<RestoredPlan, PlanError> {
    if stream.len() < 8 {
        return Err(PlanError::InvalidXaslNode("stream shorter than its sizes"));
    }
    let header_size = BigEndian::read_i32(&stream[0..4]);
    if header_size < 4 || 4 + header_size as usize + 4 > stream.len() {
        return Err(PlanError::InvalidXaslNode("bad header size"));
    }
    let header = &stream[4..4 + header_size as usize];
    let body_size_at = 4 + header_size as usize;
    let body_size = BigEndian::read_i32(&stream[body_size_at..body_size_at + 4]);
    let body_at = make_align(body_size_at + 4);
    if body_size <= 0 || body_at + body_size as usize > stream.len() {
        return Err(PlanError::InvalidXaslNode("bad body size"));
    }
    let body = &stream[body_at..body_at + body_size as usize];

    // Header: version plus the top-level counters.
    let mut h = Cursor { body: header, pos: 0 };
    let version = h.read_i32()?;
    if version != STREAM_VERSION {
        return Err(PlanError::InvalidXaslNode("unsupported stream version"));
    }
    let dbval_cnt = h.read_i32()?;
    let creator_oid = h.read_oid()?;
    let n_oid_list = h.read_i32()?;
    if n_oid_list < 0 {
        return Err(PlanError::InvalidXaslNode("negative class-oid count"));
    }
    let mut class_oid_list = Vec::with_capacity(n_oid_list as usize);
    for _ in 0..n_oid_list {
        class_oid_list.push(h.read_oid()?);
    }
    let mut tcard_list = Vec::with_capacity(n_oid_list as usize);
    for _ in 0..n_oid_list {
        tcard_list.push(h.read_i32()?);
    }

    let mut restorer = Restorer::new(body, stream.len());
    let root = restorer.restore_xasl(0)?;

    let node = restorer.arena.xasl_mut(root);
    node.dbval_cnt = dbval_cnt;
    node.creator_oid = creator_oid;
    node.class_oid_list = class_oid_list;
    node.tcard_list = tcard_list;

    Ok(RestoredPlan {
        arena: restorer.arena,
        root,
        version,
    })
}
