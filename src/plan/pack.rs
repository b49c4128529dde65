//! Pack a plan graph into the stream format the restorer reads.
//!
//! Nodes are laid out depth-first from the root; every reference becomes
//! the byte offset of the referenced node within the body, patched in
//! once that node has been emitted. A node reached through several
//! references is emitted once, so sharing survives the round trip.

use std::collections::{HashMap, HashSet, VecDeque};

use byteorder::{BigEndian, ByteOrder};

use crate::types::{Hfid, Oid};
use crate::value::DbValue;

use super::restore::{make_align, STREAM_VERSION};
use super::*;

/// Identity of a packable node.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum PackKey {
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

struct Packer<'a> {
    arena: &'a PlanArena,
    body: Vec<u8>,
    offsets: HashMap<PackKey, u32>,
    patches: Vec<(usize, PackKey)>,
    queue: VecDeque<PackKey>,
    queued: HashSet<PackKey>,
}

impl<'a> Packer<'a> {
    fn new(arena: &'a PlanArena) -> Self {
        Self {
            arena,
            body: Vec::new(),
            offsets: HashMap::new(),
            patches: Vec::new(),
            queue: VecDeque::new(),
            queued: HashSet::new(),
        }
    }

    fn i32(&mut self, v: i32) {
        let mut b = [0u8; 4];
        BigEndian::write_i32(&mut b, v);
        self.body.extend_from_slice(&b);
    }

    fn i64(&mut self, v: i64) {
        let mut b = [0u8; 8];
        BigEndian::write_i64(&mut b, v);
        self.body.extend_from_slice(&b);
    }

    fn f64(&mut self, v: f64) {
        let mut b = [0u8; 8];
        BigEndian::write_u64(&mut b, v.to_bits());
        self.body.extend_from_slice(&b);
    }

    fn boolean(&mut self, v: bool) {
        self.i32(v as i32);
    }

    fn string(&mut self, s: &str) {
        self.i32(s.len() as i32);
        self.body.extend_from_slice(s.as_bytes());
        let pad = (4 - (s.len() % 4)) % 4;
        self.body.extend_from_slice(&[0u8; 3][..pad]);
    }

    fn oid(&mut self, oid: &Oid) {
        self.i32(oid.volid as i32);
        self.i32(oid.pageid);
        self.i32(oid.slotid as i32);
    }

    fn hfid(&mut self, hfid: &Hfid) {
        self.i32(hfid.vfid.volid as i32);
        self.i32(hfid.vfid.fileid);
        self.i32(hfid.hpgid);
    }

    fn int_array(&mut self, a: &[i32]) {
        self.i32(a.len() as i32);
        for v in a {
            self.i32(*v);
        }
    }

    /// A reference field: 0 for null, otherwise the offset of the target,
    /// patched after the target is emitted.
    fn rref(&mut self, key: Option<PackKey>) {
        match key {
            None => self.i32(0),
            Some(key) => {
                self.patches.push((self.body.len(), key));
                self.i32(0);
                if self.queued.insert(key) {
                    self.queue.push_back(key);
                }
            }
        }
    }

    fn run(&mut self, root: XaslId) {
        let root_key = PackKey::Xasl(root);
        self.queued.insert(root_key);
        self.queue.push_back(root_key);

        while let Some(key) = self.queue.pop_front() {
            let aligned = make_align(self.body.len());
            self.body.resize(aligned, 0);
            self.offsets.insert(key, self.body.len() as u32);
            self.emit(key);
        }

        for (pos, key) in std::mem::take(&mut self.patches) {
            let off = self.offsets[&key];
            BigEndian::write_i32(&mut self.body[pos..pos + 4], off as i32);
        }
    }

    fn emit(&mut self, key: PackKey) {
        match key {
            PackKey::Xasl(id) => self.emit_xasl(id),
            PackKey::Pred(id) => self.emit_pred(id),
            PackKey::Regu(id) => self.emit_regu_inline(id),
            PackKey::ReguList(id) => self.emit_regu_list(id),
            PackKey::Arith(id) => self.emit_arith(id),
            PackKey::Agg(id) => self.emit_agg(id),
            PackKey::Func(id) => self.emit_func(id),
            PackKey::Val(id) => {
                let v = self.arena.value_clone(id);
                self.db_value(&v);
            }
            PackKey::Spec(id) => self.emit_spec(id),
            PackKey::Indx(id) => self.emit_indx(id),
            PackKey::Sort(id) => self.emit_sort(id),
            PackKey::SrList(id) => self.emit_srlist(id),
            PackKey::ValList(id) => self.emit_val_list(id),
            PackKey::OutPtr(id) => self.emit_outptr(id),
        }
    }

    fn db_value(&mut self, v: &DbValue) {
        match v {
            DbValue::Null => self.i32(0),
            DbValue::Int(x) => {
                self.i32(1);
                self.i32(*x);
            }
            DbValue::Bigint(x) => {
                self.i32(2);
                self.i64(*x);
            }
            DbValue::Double(x) => {
                self.i32(3);
                self.f64(*x);
            }
            DbValue::Varchar(s) => {
                self.i32(4);
                self.string(s);
            }
            DbValue::Sequence(seq) => {
                self.i32(5);
                self.i32(seq.len() as i32);
                for e in seq {
                    self.db_value(e);
                }
            }
            DbValue::Oid(oid) => {
                self.i32(6);
                self.oid(oid);
            }
        }
    }

    fn emit_xasl(&mut self, id: XaslId) {
        let node = self.arena.xasl(id);
        self.i32(node.proc.tag());
        self.i32(node.flag);
        self.i32(node.option as i32);
        self.i32(node.dbval_cnt);
        self.rref(node.next.map(PackKey::Xasl));
        self.rref(node.outptr_list.map(PackKey::OutPtr));
        self.rref(node.spec_list.map(PackKey::Spec));
        self.rref(node.val_list.map(PackKey::ValList));
        self.rref(node.where_pred.map(PackKey::Pred));
        self.rref(node.instnum_val.map(PackKey::Val));
        self.rref(node.instnum_pred.map(PackKey::Pred));
        match &node.proc {
            ProcKind::BuildList(p) => {
                self.rref(p.groupby_list.map(PackKey::Sort));
                self.rref(p.g_outptr_list.map(PackKey::OutPtr));
                self.rref(p.g_regu_list.map(PackKey::ReguList));
                self.rref(p.g_val_list.map(PackKey::ValList));
                self.rref(p.g_having_pred.map(PackKey::Pred));
                self.rref(p.g_grbynum_val.map(PackKey::Val));
                self.boolean(p.g_with_rollup);
                self.rref(p.agg_list.map(PackKey::Agg));
            }
            ProcKind::BuildValue(p) => {
                self.rref(p.having_pred.map(PackKey::Pred));
                self.rref(p.grbynum_val.map(PackKey::Val));
                self.rref(p.agg_list.map(PackKey::Agg));
                self.boolean(p.is_always_false);
            }
            ProcKind::Union(p) => {
                self.rref(p.left.map(PackKey::Xasl));
                self.rref(p.right.map(PackKey::Xasl));
            }
            ProcKind::Update(p) => {
                self.oid(&p.class_info.class_oid);
                self.hfid(&p.class_info.class_hfid);
                self.int_array(&p.class_info.att_ids);
                self.i32(p.assigns.len() as i32);
                for a in &p.assigns {
                    self.i32(a.att_idx);
                    self.rref(a.regu_var.map(PackKey::Regu));
                }
                self.rref(p.cons_pred.map(PackKey::Pred));
            }
            ProcKind::Delete(p) => {
                self.oid(&p.class_info.class_oid);
                self.hfid(&p.class_info.class_hfid);
                self.int_array(&p.class_info.att_ids);
            }
            ProcKind::Insert(p) => {
                self.oid(&p.class_oid);
                self.hfid(&p.class_hfid);
                self.int_array(&p.att_ids);
                self.rref(p.vals.map(PackKey::ReguList));
            }
        }
    }

    fn emit_pred(&mut self, id: PredId) {
        match self.arena.pred(id) {
            PredExpr::Pred(pred) => {
                self.i32(1);
                // Flatten the right-linear connective chain: repeated
                // `[lhs][op][1]` segments, a 0 marker, then the tail.
                let mut cur = pred;
                loop {
                    self.rref(cur.lhs.map(PackKey::Pred));
                    self.i32(cur.bool_op as i32);
                    match cur.rhs {
                        Some(rhs_id) => match self.arena.pred(rhs_id) {
                            PredExpr::Pred(next) => {
                                self.i32(1);
                                cur = next;
                            }
                            _ => {
                                self.i32(0);
                                self.rref(Some(PackKey::Pred(rhs_id)));
                                break;
                            }
                        },
                        None => {
                            self.i32(0);
                            self.rref(None);
                            break;
                        }
                    }
                }
            }
            PredExpr::Term(term) => {
                self.i32(2);
                self.emit_term(term);
            }
            PredExpr::Not(inner) => {
                self.i32(3);
                self.rref(inner.map(PackKey::Pred));
            }
        }
    }

    fn emit_term(&mut self, term: &EvalTerm) {
        match term {
            EvalTerm::Comp(t) => {
                self.i32(1);
                self.rref(t.lhs.map(PackKey::Regu));
                self.rref(t.rhs.map(PackKey::Regu));
                self.i32(t.rel_op as i32);
            }
            EvalTerm::Alsm(t) => {
                self.i32(2);
                self.rref(t.elem.map(PackKey::Regu));
                self.rref(t.elemset.map(PackKey::Regu));
                self.i32(t.eq_flag as i32);
                self.i32(t.rel_op as i32);
            }
            EvalTerm::Like(t) => {
                self.i32(3);
                self.rref(t.src.map(PackKey::Regu));
                self.rref(t.pattern.map(PackKey::Regu));
                self.rref(t.esc_char.map(PackKey::Regu));
            }
            EvalTerm::Rlike(t) => {
                self.i32(4);
                self.rref(t.src.map(PackKey::Regu));
                self.rref(t.pattern.map(PackKey::Regu));
                self.rref(t.case_sensitive.map(PackKey::Regu));
            }
        }
    }

    fn emit_regu_inline(&mut self, id: ReguId) {
        let regu = self.arena.regu(id);
        let tag = match &regu.value {
            ReguValue::DbVal(_) => 0,
            ReguValue::Constant(_) => 1,
            ReguValue::OrderByNum(_) => 2,
            ReguValue::InArith(_) => 3,
            ReguValue::OutArith(_) => 4,
            ReguValue::Attr(_) => 5,
            ReguValue::Position(_) => 6,
            ReguValue::ListId(_) => 7,
            ReguValue::PosValue(_) => 8,
            ReguValue::Oid => 9,
            ReguValue::Func(_) => 10,
        };
        self.i32(tag);
        self.i32(regu.flags.bits());
        self.rref(regu.vfetch_to.map(PackKey::Val));
        self.rref(regu.xasl.map(PackKey::Xasl));
        match &regu.value {
            ReguValue::DbVal(v) => {
                let v = self.arena.value_clone(*v);
                self.db_value(&v);
            }
            ReguValue::Constant(v) | ReguValue::OrderByNum(v) => {
                self.rref(Some(PackKey::Val(*v)));
            }
            ReguValue::InArith(a) | ReguValue::OutArith(a) => {
                self.rref(Some(PackKey::Arith(*a)));
            }
            ReguValue::Attr(d) => self.i32(d.id),
            ReguValue::Position(p) => self.i32(p.pos_no),
            ReguValue::ListId(l) => self.rref(Some(PackKey::SrList(*l))),
            ReguValue::PosValue(i) => self.i32(*i),
            ReguValue::Oid => {}
            ReguValue::Func(f) => self.rref(Some(PackKey::Func(*f))),
        }
    }

    fn emit_regu_list(&mut self, id: ReguListId) {
        let items = self.arena.regu_list_items(Some(id));
        self.i32(items.len() as i32);
        for regu in items {
            self.emit_regu_inline(regu);
        }
    }

    fn emit_arith(&mut self, id: ArithId) {
        let a = self.arena.arith(id);
        self.i32(a.opcode as i32);
        self.rref(Some(PackKey::Val(a.value)));
        self.rref(a.left.map(PackKey::Regu));
        self.rref(a.right.map(PackKey::Regu));
        self.rref(a.third.map(PackKey::Regu));
        self.rref(a.pred.map(PackKey::Pred));
    }

    fn emit_agg(&mut self, id: AggId) {
        let agg = self.arena.agg(id);
        self.rref(agg.next.map(PackKey::Agg));
        self.i32(agg.function as i32);
        self.i32(agg.option as i32);
        let operand = agg.operand;
        self.emit_regu_inline(operand);
        let sort_list = self.arena.agg(id).sort_list;
        self.rref(sort_list.map(PackKey::Sort));
    }

    fn emit_func(&mut self, id: FuncId) {
        let f = self.arena.func(id);
        self.i32(f.ftype as i32);
        self.rref(f.operand.map(PackKey::ReguList));
    }

    fn emit_spec(&mut self, id: SpecId) {
        let spec = self.arena.spec(id);
        let kind_tag = match spec.spec {
            SpecKind::Class(_) => 0,
            SpecKind::List(_) => 1,
        };
        self.i32(kind_tag);
        self.i32(spec.access as i32);
        self.rref(spec.indx_info.map(PackKey::Indx));
        self.rref(spec.where_key.map(PackKey::Pred));
        self.rref(spec.where_pred.map(PackKey::Pred));
        match &spec.spec {
            SpecKind::Class(c) => {
                self.oid(&c.cls_oid);
                self.hfid(&c.hfid);
                self.int_array(&c.attr_ids_pred);
                self.rref(c.cls_regu_list_pred.map(PackKey::ReguList));
                self.int_array(&c.attr_ids_rest);
                self.rref(c.cls_regu_list_rest.map(PackKey::ReguList));
            }
            SpecKind::List(l) => {
                self.rref(l.xasl_node.map(PackKey::Xasl));
                self.rref(l.list_regu_list_pred.map(PackKey::ReguList));
                self.rref(l.list_regu_list_rest.map(PackKey::ReguList));
            }
        }
        let next = self.arena.spec(id).next;
        self.rref(next.map(PackKey::Spec));
    }

    fn emit_indx(&mut self, id: IndxId) {
        let indx = self.arena.indx(id);
        self.i32(indx.indx_id.vfid.volid as i32);
        self.i32(indx.indx_id.vfid.fileid);
        self.i32(indx.indx_id.root_pageid);
        self.i32(indx.range_type as i32);
        self.boolean(indx.use_desc_index);
        self.i32(indx.key_info.key_ranges.len() as i32);
        let ranges: Vec<(KeyRangeOp, Option<ReguId>, Option<ReguId>)> = indx
            .key_info
            .key_ranges
            .iter()
            .map(|r| (r.range, r.key1, r.key2))
            .collect();
        let (is_constant, key_limit_l, key_limit_u, key_limit_reset) = (
            indx.key_info.is_constant,
            indx.key_info.key_limit_l,
            indx.key_info.key_limit_u,
            indx.key_info.key_limit_reset,
        );
        for (range, key1, key2) in ranges {
            self.i32(range as i32);
            self.rref(key1.map(PackKey::Regu));
            self.rref(key2.map(PackKey::Regu));
        }
        self.boolean(is_constant);
        self.rref(key_limit_l.map(PackKey::Regu));
        self.rref(key_limit_u.map(PackKey::Regu));
        self.boolean(key_limit_reset);
    }

    fn emit_sort(&mut self, id: SortId) {
        let mut items = Vec::new();
        let mut cur = Some(id);
        while let Some(sid) = cur {
            let node = self.arena.sort(sid);
            items.push((node.pos_descr.pos_no, node.s_order, node.s_nulls));
            cur = node.next;
        }
        self.i32(items.len() as i32);
        for (pos_no, s_order, s_nulls) in items {
            self.i32(pos_no);
            self.i32(s_order as i32);
            self.i32(s_nulls as i32);
        }
    }

    fn emit_srlist(&mut self, id: SrListId) {
        let srl = self.arena.srlist(id);
        self.boolean(srl.sorted.get());
        self.i64(srl.list.tuple_cnt.get());
    }

    fn emit_val_list(&mut self, id: ValListId) {
        let vals = self.arena.val_list(id).vals.clone();
        self.i32(vals.len() as i32);
        for v in vals {
            self.rref(Some(PackKey::Val(v)));
        }
    }

    fn emit_outptr(&mut self, id: OutPtrId) {
        let out = self.arena.outptr(id);
        self.i32(out.valptr_cnt);
        self.rref(out.valptrp.map(PackKey::ReguList));
    }
}

/// Pack a plan graph into its stream representation.
pub fn pack_plan(arena: &PlanArena, root: XaslId) -> Vec<u8> {
    let mut packer = Packer::new(arena);
    packer.run(root);
    let body = packer.body;

    // Header: version plus the root's top-level counters.
    let root_node = arena.xasl(root);
    let mut header = Vec::new();
    let mut w = |v: i32| {
        let mut b = [0u8; 4];
        BigEndian::write_i32(&mut b, v);
        header.extend_from_slice(&b);
    };
    w(STREAM_VERSION);
    w(root_node.dbval_cnt);
    w(root_node.creator_oid.volid as i32);
    w(root_node.creator_oid.pageid);
    w(root_node.creator_oid.slotid as i32);
    w(root_node.class_oid_list.len() as i32);
    for oid in &root_node.class_oid_list {
        w(oid.volid as i32);
        w(oid.pageid);
        w(oid.slotid as i32);
    }
    for i in 0..root_node.class_oid_list.len() {
        w(root_node.tcard_list.get(i).copied().unwrap_or(-1));
    }

    let mut stream = Vec::with_capacity(8 + header.len() + body.len() + STREAM_ALIGN_PAD);
    let mut b4 = [0u8; 4];
    BigEndian::write_i32(&mut b4, header.len() as i32);
    stream.extend_from_slice(&b4);
    stream.extend_from_slice(&header);
    BigEndian::write_i32(&mut b4, body.len() as i32);
    stream.extend_from_slice(&b4);
    stream.resize(make_align(stream.len()), 0);
    stream.extend_from_slice(&body);
    stream
}

const STREAM_ALIGN_PAD: usize = 8;
