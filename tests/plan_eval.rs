//! Pack → restore round trips and evaluation over restored plans.

use std::cell::Cell;

use rye_core::eval::{
    eval_pred, DbLogical, EvalContext, EvalError, ListStore, PlanExecutor,
};
use rye_core::plan::pack::pack_plan;
use rye_core::plan::restore::restore_plan;
use rye_core::plan::*;
use rye_core::types::{Hfid, Oid, Vfid};
use rye_core::value::DbValue;
use rye_core::PlanError;

fn const_regu(arena: &mut PlanArena, v: DbValue) -> ReguId {
    let val = arena.alloc_value(v);
    arena.alloc_regu(ReguVariable {
        flags: ReguFlags::empty(),
        vfetch_to: None,
        xasl: None,
        value: ReguValue::DbVal(val),
    })
}

fn pos_regu(arena: &mut PlanArena, pos: i32) -> ReguId {
    arena.alloc_regu(ReguVariable {
        flags: ReguFlags::empty(),
        vfetch_to: None,
        xasl: None,
        value: ReguValue::Position(PosDescr { pos_no: pos }),
    })
}

fn comp_pred(arena: &mut PlanArena, lhs: ReguId, rhs: ReguId, op: RelOp) -> PredId {
    arena.alloc_pred(PredExpr::Term(EvalTerm::Comp(CompTerm {
        lhs: Some(lhs),
        rhs: Some(rhs),
        rel_op: op,
    })))
}

fn empty_buildlist(arena: &mut PlanArena) -> XaslId {
    arena.alloc_xasl(XaslNode::new(ProcKind::BuildList(BuildListProc {
        groupby_list: None,
        g_outptr_list: None,
        g_regu_list: None,
        g_val_list: None,
        g_having_pred: None,
        g_grbynum_val: None,
        g_with_rollup: false,
        agg_list: None,
    })))
}

/// A representative plan: a build-list node with a filtered class scan,
/// an index with a key range, a group-by with one aggregate, and a
/// where-predicate mixing connectives and term kinds.
fn representative_plan(arena: &mut PlanArena) -> XaslId {
    let a = pos_regu(arena, 0);
    let one = const_regu(arena, DbValue::Int(1));
    let b = pos_regu(arena, 1);
    let two = const_regu(arena, DbValue::Int(2));

    let a_eq_1 = comp_pred(arena, a, one, RelOp::Eq);
    let b_eq_2 = comp_pred(arena, b, two, RelOp::Eq);
    let name = pos_regu(arena, 2);
    let pat = const_regu(arena, "r%e".into());
    let like = arena.alloc_pred(PredExpr::Term(EvalTerm::Like(LikeTerm {
        src: Some(name),
        pattern: Some(pat),
        esc_char: None,
    })));
    let and_tail = arena.alloc_pred(PredExpr::Pred(Pred {
        lhs: Some(b_eq_2),
        rhs: Some(like),
        bool_op: BoolOp::And,
    }));
    let where_pred = arena.alloc_pred(PredExpr::Pred(Pred {
        lhs: Some(a_eq_1),
        rhs: Some(and_tail),
        bool_op: BoolOp::And,
    }));

    let key_regu = const_regu(arena, DbValue::Int(100));
    let indx = arena.alloc_indx(IndxInfo {
        indx_id: Btid {
            vfid: Vfid {
                volid: 3,
                fileid: 77,
            },
            root_pageid: 12,
        },
        range_type: RangeType::Range,
        use_desc_index: false,
        key_info: KeyInfo {
            key_ranges: vec![KeyRange {
                range: KeyRangeOp::GeLt,
                key1: Some(key_regu),
                key2: None,
            }],
            is_constant: true,
            key_limit_l: None,
            key_limit_u: None,
            key_limit_reset: false,
        },
    });

    let attr_regu = arena.alloc_regu(ReguVariable {
        flags: ReguFlags::HIDDEN_COLUMN,
        vfetch_to: None,
        xasl: None,
        value: ReguValue::Attr(AttrDescr { id: 5 }),
    });
    let scan_list = arena.alloc_regu_list(ReguListNode {
        value: attr_regu,
        next: None,
    });
    let spec = arena.alloc_spec(AccessSpec {
        spec: SpecKind::Class(ClsSpec {
            cls_oid: Oid {
                volid: 0,
                pageid: 311,
                slotid: 4,
            },
            hfid: Hfid {
                vfid: Vfid {
                    volid: 0,
                    fileid: 42,
                },
                hpgid: 7,
            },
            attr_ids_pred: vec![5],
            cls_regu_list_pred: Some(scan_list),
            attr_ids_rest: vec![6, 9],
            cls_regu_list_rest: None,
        }),
        access: AccessMethod::Index,
        indx_info: Some(indx),
        where_key: None,
        where_pred: Some(where_pred),
        where_eval: None,
        key_eval: None,
        next: None,
    });

    let agg_operand = pos_regu(arena, 1);
    let acc_value = arena.alloc_value(DbValue::Null);
    let acc_value2 = arena.alloc_value(DbValue::Null);
    let agg = arena.alloc_agg(AggregateExpr {
        next: None,
        function: AggFunc::Sum,
        option: QueryOptions::All,
        operand: agg_operand,
        sort_list: None,
        acc: AggAccumulator {
            value: acc_value,
            value2: acc_value2,
            curr_cnt: Cell::new(0),
        },
    });

    let groupby = arena.alloc_sort(SortListNode {
        next: None,
        pos_descr: PosDescr { pos_no: 0 },
        s_order: SortOrder::Asc,
        s_nulls: SortNulls::First,
    });

    let root = arena.alloc_xasl(XaslNode::new(ProcKind::BuildList(BuildListProc {
        groupby_list: Some(groupby),
        g_outptr_list: None,
        g_regu_list: None,
        g_val_list: None,
        g_having_pred: None,
        g_grbynum_val: None,
        g_with_rollup: false,
        agg_list: Some(agg),
    })));
    {
        let node = arena.xasl_mut(root);
        node.option = QueryOptions::Distinct;
        node.dbval_cnt = 3;
        node.spec_list = Some(spec);
        node.where_pred = Some(where_pred);
        node.creator_oid = Oid {
            volid: 0,
            pageid: 55,
            slotid: 1,
        };
        node.class_oid_list = vec![Oid {
            volid: 0,
            pageid: 311,
            slotid: 4,
        }];
        node.tcard_list = vec![12000];
    }
    root
}

#[test]
fn representative_plan_round_trips() {
    let mut arena = PlanArena::new();
    let root = representative_plan(&mut arena);
    let stream = pack_plan(&arena, root);
    let plan = restore_plan(&stream).unwrap();
    let r = &plan.arena;
    let node = r.xasl(plan.root);

    assert_eq!(node.option, QueryOptions::Distinct);
    assert_eq!(node.dbval_cnt, 3);
    assert_eq!(node.creator_oid.pageid, 55);
    assert_eq!(node.class_oid_list.len(), 1);
    assert_eq!(node.class_oid_list[0].pageid, 311);
    assert_eq!(node.tcard_list, vec![12000]);

    // Runtime fields are freshly initialized.
    assert_eq!(node.status.get(), XaslStatus::Initialized);
    assert!(!node.query_in_progress.get());
    assert_eq!(node.stats.fetched_pages.get(), 0);

    // The scan spec round-trips with its index and attribute lists.
    let spec = r.spec(node.spec_list.expect("spec list"));
    assert_eq!(spec.access, AccessMethod::Index);
    let SpecKind::Class(cls) = &spec.spec else {
        panic!("expected a class spec");
    };
    assert_eq!(cls.cls_oid.pageid, 311);
    assert_eq!(cls.hfid.vfid.fileid, 42);
    assert_eq!(cls.attr_ids_pred, vec![5]);
    assert_eq!(cls.attr_ids_rest, vec![6, 9]);
    let pred_list = r.regu_list_items(cls.cls_regu_list_pred);
    assert_eq!(pred_list.len(), 1);
    assert!(r.regu(pred_list[0]).flags.contains(ReguFlags::HIDDEN_COLUMN));

    let indx = r.indx(spec.indx_info.expect("index info"));
    assert_eq!(indx.indx_id.vfid.fileid, 77);
    assert_eq!(indx.range_type, RangeType::Range);
    assert_eq!(indx.key_info.key_ranges.len(), 1);
    assert_eq!(indx.key_info.key_ranges[0].range, KeyRangeOp::GeLt);
    assert!(indx.key_info.is_constant);

    // A single-term where-pred would get a specialized entry; this one is
    // a connective tree, so the general evaluator is installed.
    assert!(spec.where_eval.is_some());

    // The group-by and aggregate survive with a zeroed accumulator.
    let ProcKind::BuildList(bl) = &node.proc else {
        panic!("expected a build-list proc");
    };
    let agg = r.agg(bl.agg_list.expect("aggregate"));
    assert_eq!(agg.function, AggFunc::Sum);
    assert_eq!(agg.acc.curr_cnt.get(), 0);
    assert_eq!(r.value_clone(agg.acc.value), DbValue::Null);
    let sort = r.sort(bl.groupby_list.expect("group-by"));
    assert_eq!(sort.pos_descr.pos_no, 0);
    assert_eq!(sort.s_order, SortOrder::Asc);

    // The where predicate on the node and on the spec restored from the
    // same offset: one shared node.
    assert_eq!(node.where_pred, spec.where_pred);
}

#[test]
fn shared_offsets_restore_to_shared_handles() {
    // Two regu-variable-list references point at the same packed list;
    // after restore both yield the same handle, and an update through the
    // first is visible through the second.
    let mut arena = PlanArena::new();
    let regu = const_regu(&mut arena, DbValue::Int(8));
    let shared = arena.alloc_regu_list(ReguListNode {
        value: regu,
        next: None,
    });
    let out = arena.alloc_outptr(OutPtrList {
        valptr_cnt: 1,
        valptrp: Some(shared),
    });
    let root = empty_buildlist(&mut arena);
    {
        let node = arena.xasl_mut(root);
        node.outptr_list = Some(out);
        let ProcKind::BuildList(bl) = &mut node.proc else {
            unreachable!()
        };
        bl.g_regu_list = Some(shared);
    }

    let stream = pack_plan(&arena, root);
    let plan = restore_plan(&stream).unwrap();
    let r = plan.arena;
    let node = r.xasl(plan.root);

    let via_out = r.outptr(node.outptr_list.unwrap()).valptrp.unwrap();
    let ProcKind::BuildList(bl) = &node.proc else {
        unreachable!()
    };
    let via_proc = bl.g_regu_list.unwrap();
    assert_eq!(via_out, via_proc);

    // Mutating next through one reference is visible through the other.
    let mut r = r;
    let extra_regu = const_regu(&mut r, DbValue::Int(9));
    let tail = r.alloc_regu_list(ReguListNode {
        value: extra_regu,
        next: None,
    });
    r.regu_list_mut(via_out).next = Some(tail);
    assert_eq!(r.regu_list(via_proc).next, Some(tail));
}

#[test]
fn union_shares_a_subtree_between_branches() {
    let mut arena = PlanArena::new();
    let shared_child = empty_buildlist(&mut arena);
    let left = arena.alloc_xasl(XaslNode::new(ProcKind::Union(UnionProc {
        left: Some(shared_child),
        right: None,
    })));
    let right = arena.alloc_xasl(XaslNode::new(ProcKind::Union(UnionProc {
        left: Some(shared_child),
        right: None,
    })));
    let root = arena.alloc_xasl(XaslNode::new(ProcKind::Union(UnionProc {
        left: Some(left),
        right: Some(right),
    })));

    let stream = pack_plan(&arena, root);
    let plan = restore_plan(&stream).unwrap();
    let r = &plan.arena;
    let ProcKind::Union(u) = &r.xasl(plan.root).proc else {
        panic!()
    };
    let ProcKind::Union(ul) = &r.xasl(u.left.unwrap()).proc else {
        panic!()
    };
    let ProcKind::Union(ur) = &r.xasl(u.right.unwrap()).proc else {
        panic!()
    };
    // Shared in the original, shared in the restored graph.
    assert_eq!(ul.left.unwrap(), ur.left.unwrap());
    assert_ne!(u.left.unwrap(), u.right.unwrap());
}

#[test]
fn update_proc_round_trips() {
    let mut arena = PlanArena::new();
    let assign_val = const_regu(&mut arena, DbValue::Varchar("renamed".into()));
    let cons = {
        let lhs = pos_regu(&mut arena, 0);
        let rhs = const_regu(&mut arena, DbValue::Int(0));
        comp_pred(&mut arena, lhs, rhs, RelOp::Ge)
    };
    let root = arena.alloc_xasl(XaslNode::new(ProcKind::Update(UpdateProc {
        class_info: UpddelClass {
            class_oid: Oid {
                volid: 1,
                pageid: 99,
                slotid: 2,
            },
            class_hfid: Hfid {
                vfid: Vfid {
                    volid: 1,
                    fileid: 13,
                },
                hpgid: 3,
            },
            att_ids: vec![4, 8],
        },
        assigns: vec![UpdateAssign {
            att_idx: 1,
            regu_var: Some(assign_val),
        }],
        cons_pred: Some(cons),
    })));

    let stream = pack_plan(&arena, root);
    let plan = restore_plan(&stream).unwrap();
    let ProcKind::Update(up) = &plan.arena.xasl(plan.root).proc else {
        panic!("expected an update proc");
    };
    assert_eq!(up.class_info.class_oid.pageid, 99);
    assert_eq!(up.class_info.att_ids, vec![4, 8]);
    assert_eq!(up.assigns.len(), 1);
    assert_eq!(up.assigns[0].att_idx, 1);
    assert!(up.cons_pred.is_some());
    let regu = up.assigns[0].regu_var.unwrap();
    let ReguValue::DbVal(v) = &plan.arena.regu(regu).value else {
        panic!()
    };
    assert_eq!(
        plan.arena.value_clone(*v),
        DbValue::Varchar("renamed".into())
    );
}

#[test]
fn malformed_streams_are_rejected() {
    let mut arena = PlanArena::new();
    let root = representative_plan(&mut arena);
    let stream = pack_plan(&arena, root);

    // Truncation anywhere in the body fails cleanly.
    let truncated = &stream[..stream.len() - 6];
    assert!(matches!(
        restore_plan(truncated),
        Err(PlanError::InvalidXaslNode(_)) | Err(PlanError::OffsetOutOfRange { .. })
    ));

    // Garbage where sizes live fails cleanly.
    assert!(restore_plan(&[0u8; 7]).is_err());
    let mut bad = stream.clone();
    let len = bad.len();
    bad[len - 1] ^= 0xff;
    // The last byte belongs to a packed node; flipping it may or may not
    // break a tag, but it must never panic.
    let _ = restore_plan(&bad);

    // An unsupported version is rejected.
    let mut wrong_version = stream.clone();
    wrong_version[4..8].copy_from_slice(&99i32.to_be_bytes());
    assert!(restore_plan(&wrong_version).is_err());
}

#[test]
fn three_valued_logic_over_a_restored_plan() {
    // pred = (col0 = 1 AND col1 = 2), evaluated over tuples.
    let mut arena = PlanArena::new();
    let a = pos_regu(&mut arena, 0);
    let one = const_regu(&mut arena, DbValue::Int(1));
    let b = pos_regu(&mut arena, 1);
    let two = const_regu(&mut arena, DbValue::Int(2));
    let a_eq_1 = comp_pred(&mut arena, a, one, RelOp::Eq);
    let b_eq_2 = comp_pred(&mut arena, b, two, RelOp::Eq);
    let pred = arena.alloc_pred(PredExpr::Pred(Pred {
        lhs: Some(a_eq_1),
        rhs: Some(b_eq_2),
        bool_op: BoolOp::And,
    }));
    let root = empty_buildlist(&mut arena);
    arena.xasl_mut(root).where_pred = Some(pred);

    let stream = pack_plan(&arena, root);
    let plan = restore_plan(&stream).unwrap();
    let pred = plan.arena.xasl(plan.root).where_pred.unwrap();

    let eval_with = |tuple: &[DbValue]| {
        let mut lists = ListStore::new();
        let mut ctx = EvalContext::new(&plan.arena, &mut lists);
        ctx.tuple = Some(tuple);
        eval_pred(&mut ctx, pred)
    };

    // a NULL, b = 3: UNKNOWN AND FALSE = FALSE... b=3 != 2 makes the
    // conjunction decisively false; a NULL with b = 2 leaves it unknown.
    assert_eq!(
        eval_with(&[DbValue::Null, DbValue::Int(3)]),
        DbLogical::False
    );
    assert_eq!(
        eval_with(&[DbValue::Null, DbValue::Int(2)]),
        DbLogical::Unknown
    );
    assert_eq!(
        eval_with(&[DbValue::Int(1), DbValue::Int(2)]),
        DbLogical::True
    );
}

#[test]
fn restored_rlike_compiles_lazily_and_reuses() {
    let mut arena = PlanArena::new();
    let src = pos_regu(&mut arena, 0);
    let pat = const_regu(&mut arena, "^ab+c$".into());
    let cs = const_regu(&mut arena, DbValue::Int(1));
    let pred = arena.alloc_pred(PredExpr::Term(EvalTerm::Rlike(RlikeTerm {
        src: Some(src),
        pattern: Some(pat),
        case_sensitive: Some(cs),
        compiled: RegexCell::new(),
    })));
    let root = empty_buildlist(&mut arena);
    arena.xasl_mut(root).where_pred = Some(pred);

    let stream = pack_plan(&arena, root);
    let plan = restore_plan(&stream).unwrap();
    let pred = plan.arena.xasl(plan.root).where_pred.unwrap();

    // Compiled state starts empty after a restore.
    let PredExpr::Term(EvalTerm::Rlike(term)) = plan.arena.pred(pred) else {
        panic!()
    };
    assert!(!term.compiled.is_compiled());

    let mut lists = ListStore::new();
    let mut ctx = EvalContext::new(&plan.arena, &mut lists);
    let tuple1 = [DbValue::Varchar("abbbc".into())];
    ctx.tuple = Some(&tuple1);
    assert_eq!(eval_pred(&mut ctx, pred), DbLogical::True);
    assert!(term.compiled.is_compiled());

    // Second evaluation reuses the compiled pattern.
    let mut lists = ListStore::new();
    let mut ctx = EvalContext::new(&plan.arena, &mut lists);
    let tuple2 = [DbValue::Varchar("abd".into())];
    ctx.tuple = Some(&tuple2);
    assert_eq!(eval_pred(&mut ctx, pred), DbLogical::False);
}

struct RowsExecutor {
    srl: SrListId,
    rows: Vec<DbValue>,
}

impl PlanExecutor for RowsExecutor {
    fn execute(
        &self,
        arena: &PlanArena,
        xasl: XaslId,
        lists: &mut ListStore,
    ) -> Result<(), EvalError> {
        lists.insert(self.srl, self.rows.clone());
        arena.xasl(xasl).status.set(XaslStatus::Success);
        Ok(())
    }
}

#[test]
fn exists_and_in_over_restored_subplan() {
    let mut arena = PlanArena::new();
    let sub = empty_buildlist(&mut arena);
    let srl = arena.alloc_srlist(SortedListId {
        sorted: Cell::new(false),
        list: ListDescr {
            tuple_cnt: Cell::new(0),
        },
    });
    let list_regu = arena.alloc_regu(ReguVariable {
        flags: ReguFlags::empty(),
        vfetch_to: None,
        xasl: Some(sub),
        value: ReguValue::ListId(srl),
    });
    let elem = pos_regu(&mut arena, 0);
    let in_pred = arena.alloc_pred(PredExpr::Term(EvalTerm::Alsm(AlsmTerm {
        elem: Some(elem),
        elemset: Some(list_regu),
        eq_flag: QlFlag::Some,
        rel_op: RelOp::Eq,
    })));
    let exists_pred = arena.alloc_pred(PredExpr::Term(EvalTerm::Comp(CompTerm {
        lhs: Some(list_regu),
        rhs: None,
        rel_op: RelOp::Exists,
    })));
    let both = arena.alloc_pred(PredExpr::Pred(Pred {
        lhs: Some(exists_pred),
        rhs: Some(in_pred),
        bool_op: BoolOp::And,
    }));
    let root = empty_buildlist(&mut arena);
    arena.xasl_mut(root).where_pred = Some(both);

    let stream = pack_plan(&arena, root);
    let plan = restore_plan(&stream).unwrap();
    let pred = plan.arena.xasl(plan.root).where_pred.unwrap();

    // Find the restored list handle through the predicate tree.
    let PredExpr::Pred(p) = plan.arena.pred(pred) else {
        panic!()
    };
    let PredExpr::Term(EvalTerm::Comp(exists)) = plan.arena.pred(p.lhs.unwrap()) else {
        panic!()
    };
    let ReguValue::ListId(restored_srl) = &plan.arena.regu(exists.lhs.unwrap()).value else {
        panic!()
    };
    let restored_srl = *restored_srl;

    let executor = RowsExecutor {
        srl: restored_srl,
        rows: vec![DbValue::Int(5), DbValue::Int(3)],
    };
    let mut lists = ListStore::new();
    let mut ctx = EvalContext::new(&plan.arena, &mut lists);
    ctx.executor = Some(&executor);
    ctx.tuple = Some(&[DbValue::Int(3)]);
    assert_eq!(eval_pred(&mut ctx, pred), DbLogical::True);

    let mut lists = ListStore::new();
    let mut ctx = EvalContext::new(&plan.arena, &mut lists);
    ctx.executor = Some(&executor);
    ctx.tuple = Some(&[DbValue::Int(4)]);
    assert_eq!(eval_pred(&mut ctx, pred), DbLogical::False);
}

#[test]
fn single_term_filters_get_specialized_entries() {
    let mut arena = PlanArena::new();
    let lhs = pos_regu(&mut arena, 0);
    let rhs = const_regu(&mut arena, DbValue::Int(10));
    let where_pred = comp_pred(&mut arena, lhs, rhs, RelOp::Lt);
    let spec = arena.alloc_spec(AccessSpec {
        spec: SpecKind::List(ListSpec {
            xasl_node: None,
            list_regu_list_pred: None,
            list_regu_list_rest: None,
        }),
        access: AccessMethod::Sequential,
        indx_info: None,
        where_key: None,
        where_pred: Some(where_pred),
        where_eval: None,
        key_eval: None,
        next: None,
    });
    let root = empty_buildlist(&mut arena);
    arena.xasl_mut(root).spec_list = Some(spec);

    let stream = pack_plan(&arena, root);
    let plan = restore_plan(&stream).unwrap();
    let spec = plan.arena.spec(plan.arena.xasl(plan.root).spec_list.unwrap());
    let eval = spec.where_eval.expect("installed at restore");

    let mut lists = ListStore::new();
    let mut ctx = EvalContext::new(&plan.arena, &mut lists);
    ctx.tuple = Some(&[DbValue::Int(3)]);
    assert_eq!(eval(&mut ctx, spec.where_pred.unwrap()), DbLogical::True);
}

#[test]
fn deep_chains_restore_within_flat_recursion() {
    // A long right-linear AND chain packs flat and restores without deep
    // recursion; evaluation still honors its depth bound separately.
    let mut arena = PlanArena::new();
    let mut pred = {
        let lhs = pos_regu(&mut arena, 0);
        let rhs = const_regu(&mut arena, DbValue::Int(0));
        comp_pred(&mut arena, lhs, rhs, RelOp::Ge)
    };
    for _ in 0..200 {
        let lhs = pos_regu(&mut arena, 0);
        let rhs = const_regu(&mut arena, DbValue::Int(0));
        let leaf = comp_pred(&mut arena, lhs, rhs, RelOp::Ge);
        pred = arena.alloc_pred(PredExpr::Pred(Pred {
            lhs: Some(leaf),
            rhs: Some(pred),
            bool_op: BoolOp::And,
        }));
    }
    let root = empty_buildlist(&mut arena);
    arena.xasl_mut(root).where_pred = Some(pred);

    let stream = pack_plan(&arena, root);
    let plan = restore_plan(&stream).unwrap();
    let pred = plan.arena.xasl(plan.root).where_pred.unwrap();

    let mut lists = ListStore::new();
    let mut ctx = EvalContext::new(&plan.arena, &mut lists);
    ctx.tuple = Some(&[DbValue::Int(7)]);
    // The chain walker flattens right-linear AND, so the default depth
    // bound is not exceeded.
    assert_eq!(eval_pred(&mut ctx, pred), DbLogical::True);
}
