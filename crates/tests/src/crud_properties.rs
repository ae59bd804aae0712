//! Property tests for stage CRUD on a pipeline state

use ampdsp_core::domain::{
    limits::MAX_STAGES, PipelineState, PoolKind, StageType,
};
use crate::SAMPLE_RATE;
use proptest::prelude::*;

fn stage_types() -> impl Strategy<Value = StageType> {
    prop::sample::select(StageType::NON_BIQUAD.to_vec())
}

fn types_of(state: &PipelineState, channel: usize) -> Vec<StageType> {
    state
        .channel(channel)
        .unwrap()
        .stages()
        .iter()
        .map(|s| s.stage_type())
        .collect()
}

proptest! {
    #[test]
    fn prop_reorder_applies_permutation(
        types in prop::collection::vec(stage_types(), 1..8),
        seed in any::<u64>(),
    ) {
        let mut state = PipelineState::new(SAMPLE_RATE);
        for &t in &types {
            // Pool-backed types may run out of slots; those are simply skipped
            let _ = state.add_stage(0, t, None);
        }
        let before = types_of(&state, 0);

        let mut order: Vec<usize> = (0..before.len()).collect();
        let mut rng = seed;
        for i in (1..order.len()).rev() {
            rng = rng.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            order.swap(i, (rng >> 33) as usize % (i + 1));
        }

        state.reorder_stages(0, &order).unwrap();
        let after = types_of(&state, 0);
        for (i, &src) in order.iter().enumerate() {
            prop_assert_eq!(after[i], before[src]);
        }
    }

    #[test]
    fn prop_add_then_remove_keeps_bounds_and_slots(
        types in prop::collection::vec(stage_types(), 0..30),
        removals in prop::collection::vec(any::<prop::sample::Index>(), 0..30),
    ) {
        let mut state = PipelineState::new(SAMPLE_RATE);
        for &t in &types {
            let _ = state.add_stage(1, t, None);
            prop_assert!(state.channel(1).unwrap().len() <= MAX_STAGES);
        }
        for index in removals {
            let len = state.channel(1).unwrap().len();
            if len == 0 {
                break;
            }
            state.remove_stage(1, index.index(len)).unwrap();
        }

        let held = |kind: PoolKind| {
            state
                .channel(1)
                .unwrap()
                .stages()
                .iter()
                .filter(|s| matches!(s.pool_slot(), Some((k, _)) if k == kind))
                .count()
        };
        for kind in [PoolKind::Fir, PoolKind::Delay] {
            prop_assert_eq!(state.pools().used_count(kind), held(kind));
        }
    }
}
