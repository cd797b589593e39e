use std::collections::HashMap;

use zbsched::distributed::pipeline::{build, CostModel, OpKind, Operation, Placement, ScheduleBuilder, StageTopology};
use zbsched::Error;

fn topology(p: usize) -> StageTopology {
    StageTopology::new(p, p * 2).unwrap()
}

/// Compact `F0 B0 ...` rendering of a rank's compute operations.
fn compute_order(schedule: &zbsched::Schedule, rank: usize) -> Vec<String> {
    schedule
        .rank(rank)
        .unwrap()
        .compute_ops()
        .map(|op| match *op {
            Operation::Forward { microbatch, .. } => format!("F{microbatch}"),
            Operation::Backward { microbatch, .. } => format!("B{microbatch}"),
            Operation::BackwardWeights { microbatch, .. } => format!("W{microbatch}"),
            Operation::OptimizerStep => "Opt".to_string(),
            Operation::PostValidationSync => "Sync".to_string(),
            Operation::CommSend { .. } | Operation::CommRecv { .. } => unreachable!(),
        })
        .collect()
}

#[test]
fn test_every_microbatch_visits_every_stage_within_memory_limit() {
    for p in 1..=4 {
        for m in 1..=6 {
            for limit in 1..=m + 1 {
                let schedule = build(&topology(p), m, limit, 1)
                    .unwrap_or_else(|e| panic!("P={p} M={m} L={limit}: {e}"));
                assert_eq!(schedule.num_ranks(), p);

                for rs in schedule.ranks() {
                    let mut pending = 0usize;
                    let mut seen: HashMap<(OpKind, usize), usize> = HashMap::new();
                    for op in rs.ops() {
                        match op {
                            Operation::Forward { microbatch, .. } => {
                                pending += 1;
                                assert!(pending <= limit, "P={p} M={m} L={limit} rank {}", rs.rank());
                                *seen.entry((OpKind::Forward, *microbatch)).or_default() += 1;
                            }
                            Operation::Backward { microbatch, .. } => {
                                assert!(pending > 0);
                                pending -= 1;
                                *seen.entry((OpKind::Backward, *microbatch)).or_default() += 1;
                            }
                            _ => {}
                        }
                    }
                    assert_eq!(pending, 0);
                    for mb in 0..m {
                        assert_eq!(seen.get(&(OpKind::Forward, mb)), Some(&1));
                        assert_eq!(seen.get(&(OpKind::Backward, mb)), Some(&1));
                    }
                    assert_eq!(rs.ops().last(), Some(&Operation::OptimizerStep));
                }
            }
        }
    }
}

#[test]
fn test_build_is_deterministic() {
    let a = build(&topology(4), 8, 3, 1).unwrap();
    let b = build(&topology(4), 8, 3, 1).unwrap();
    assert_eq!(a, b);

    let builder = ScheduleBuilder::new(StageTopology::new(2, 8).unwrap(), 6, 4, 2).split_backward(true);
    assert_eq!(builder.build().unwrap(), builder.build().unwrap());
}

#[test]
fn test_single_microbatch_is_sequential() {
    let schedule = build(&topology(3), 1, 1, 1).unwrap();
    for rank in 0..3 {
        assert_eq!(compute_order(&schedule, rank), ["F0", "B0", "Opt"]);
    }
}

#[test]
fn test_limit_equal_to_microbatches_runs_all_forwards_first() {
    let m = 4;
    let schedule = build(&topology(2), m, m, 1).unwrap();
    for rank in 0..2 {
        let order = compute_order(&schedule, rank);
        assert!(order[..m].iter().all(|op| op.starts_with('F')), "rank {rank}: {order:?}");
    }
}

#[test]
fn test_limit_one_strictly_alternates() {
    let schedule = build(&topology(3), 4, 1, 1).unwrap();
    for rank in 0..3 {
        assert_eq!(
            compute_order(&schedule, rank),
            ["F0", "B0", "F1", "B1", "F2", "B2", "F3", "B3", "Opt"]
        );
    }
}

#[test]
fn test_two_stages_four_microbatches_limit_two() {
    let schedule = build(&topology(2), 4, 2, 1).unwrap();
    for rs in schedule.ranks() {
        assert_eq!(rs.count(OpKind::Forward), 4);
        assert_eq!(rs.count(OpKind::Backward), 4);
        assert_eq!(rs.count(OpKind::OptimizerStep), 1);
    }

    let rank0 = compute_order(&schedule, 0);
    assert_eq!(rank0[2], "B0");
    assert_eq!(rank0, ["F0", "F1", "B0", "F2", "B1", "F3", "B2", "B3", "Opt"]);

    // Rank 0 only talks to rank 1: four activations out, four gradients in.
    let r0 = schedule.rank(0).unwrap();
    assert_eq!(r0.count(OpKind::CommSend), 4);
    assert_eq!(r0.count(OpKind::CommRecv), 4);
}

#[test]
fn test_interleaved_schedule_covers_every_virtual_stage() {
    let topo = StageTopology::new(2, 8).unwrap();
    for limit in [4, 8] {
        let schedule = ScheduleBuilder::new(topo.clone(), 4, limit, 2).build().unwrap();
        assert_eq!(schedule.interleave_factor(), 2);
        assert_eq!(schedule.layout().num_logical_stages(), 4);
        for rs in schedule.ranks() {
            assert_eq!(rs.count(OpKind::Forward), 8);
            assert_eq!(rs.count(OpKind::Backward), 8);
            let chunks: std::collections::HashSet<_> =
                rs.compute_ops().filter_map(|op| op.stage()).map(|s| s.chunk).collect();
            assert_eq!(chunks.len(), 2);
        }
    }
}

#[test]
fn test_interleaving_with_too_small_limit_is_rejected() {
    let topo = StageTopology::new(2, 8).unwrap();
    let err = ScheduleBuilder::new(topo, 4, 2, 2).build().unwrap_err();
    assert!(matches!(
        err,
        Error::Configuration {
            parameter: "memory_limit",
            ..
        }
    ));
}

#[test]
fn test_v_shape_builds_with_p_plus_one_pending() {
    let comm = CostModel {
        comm: 2,
        ..CostModel::default()
    };
    for p in 1..=4 {
        for m in 1..=6 {
            for limit in p + 1..=2 * p + 1 {
                for (split, cost) in [(false, CostModel::default()), (true, comm)] {
                    let schedule = ScheduleBuilder::new(StageTopology::new(p, p * 4).unwrap(), m, limit, 2)
                        .placement(Placement::VShape)
                        .split_backward(split)
                        .cost_model(cost)
                        .build()
                        .unwrap_or_else(|e| panic!("P={p} M={m} L={limit} split={split}: {e}"));
                    for rs in schedule.ranks() {
                        assert_eq!(rs.count(OpKind::Forward), 2 * m);
                        assert_eq!(rs.count(OpKind::Backward), 2 * m);
                        let logical: Vec<usize> = schedule.layout().stages_of(rs.rank()).map(|s| s.logical).collect();
                        assert_eq!(logical, vec![rs.rank(), 2 * p - 1 - rs.rank()]);
                    }
                }
            }
        }
    }
}

#[test]
fn test_v_shape_first_forward_and_last_backward_share_rank_zero() {
    let schedule = ScheduleBuilder::new(StageTopology::new(4, 8).unwrap(), 8, 8, 2)
        .placement(Placement::VShape)
        .split_backward(true)
        .build()
        .unwrap();
    let layout = schedule.layout();
    let r0 = schedule.rank(0).unwrap();
    let stages: std::collections::HashSet<usize> =
        r0.compute_ops().filter_map(|op| op.stage()).map(|s| s.logical).collect();
    assert_eq!(stages, [0, 7].into_iter().collect());
    assert!(layout.is_first(layout.stage(0, 0)));
    assert!(layout.is_last(layout.stage(0, 1)));
    assert!(schedule.stats().bubble_ratio() < 0.25);
}

#[test]
fn test_interleave_factor_must_divide_layers_per_rank() {
    let topo = StageTopology::new(2, 6).unwrap();
    let err = build(&topo, 4, 2, 2).unwrap_err();
    match err {
        Error::Configuration { parameter, reason } => {
            assert_eq!(parameter, "interleave_factor");
            assert!(reason.contains("evenly divide"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_split_backward_schedules_every_weight_pass() {
    let schedule = ScheduleBuilder::new(topology(3), 6, 3, 1)
        .split_backward(true)
        .build()
        .unwrap();
    for rs in schedule.ranks() {
        assert_eq!(rs.count(OpKind::BackwardWeights), 6);
        let ops = rs.ops();
        // Each weight pass follows its own input-gradient backward.
        for (i, op) in ops.iter().enumerate() {
            if let Operation::BackwardWeights { stage, microbatch } = *op {
                assert!(ops[..i].contains(&Operation::Backward { stage, microbatch }));
            }
        }
    }
}

#[test]
fn test_post_validation_sync_closes_the_schedule() {
    let schedule = ScheduleBuilder::new(topology(2), 2, 2, 1)
        .post_validation(true)
        .build()
        .unwrap();
    for rs in schedule.ranks() {
        let n = rs.len();
        assert_eq!(rs.ops()[n - 2], Operation::OptimizerStep);
        assert_eq!(rs.ops()[n - 1], Operation::PostValidationSync);
    }
}

#[test]
fn test_stats_report_bubbles() {
    let schedule = build(&topology(4), 8, 4, 1).unwrap();
    let stats = schedule.stats();
    assert_eq!(stats.busy, vec![16; 4]);
    assert!(stats.makespan >= 16);
    assert!(stats.bubble_ratio() > 0.0 && stats.bubble_ratio() < 1.0);

    let slow_comm = ScheduleBuilder::new(topology(4), 8, 4, 1)
        .cost_model(CostModel {
            comm: 3,
            ..CostModel::default()
        })
        .build()
        .unwrap();
    assert!(slow_comm.stats().makespan > stats.makespan);
}

#[test]
fn test_schedule_serializes_to_json() {
    let schedule = build(&topology(2), 2, 1, 1).unwrap();
    let json = serde_json::to_string(schedule.rank(0).unwrap()).unwrap();
    assert!(json.contains("\"op\":\"forward\""));
    assert!(json.contains("\"op\":\"comm_send\""));
}
