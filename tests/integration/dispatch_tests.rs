//! Feed dispatcher end-to-end: inbox → engine → outcome publication.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use kibblet::adapters::time::{Clock, SimClock};
use kibblet::dispatch::FeedDispatcher;
use kibblet::engine::DispensingEngine;
use kibblet::events::{EventBroker, EventPayload, Topic};
use kibblet::hub::{DeviceHub, FeedCommand, FeedingStatus, SubmitError};
use kibblet::store::{Ingredient, Recipe, RecipeStore};

use crate::mock_hw::{feeder_rig, MemoryNvs, MockFeedHw, MockScale, SimTankSpec};

const UID_A: u64 = 0xA1;
const UID_B: u64 = 0xB2;

struct Rig {
    dispatcher: FeedDispatcher<SimClock, MemoryNvs>,
    hw: MockFeedHw,
    scale: MockScale,
    clock: SimClock,
    hub: Arc<DeviceHub>,
    completions: Arc<Mutex<Vec<(bool, f32)>>>,
    errors: Arc<Mutex<Vec<&'static str>>>,
}

static DIR_SEQ: AtomicUsize = AtomicUsize::new(0);

fn temp_paths() -> [PathBuf; 3] {
    let seq = DIR_SEQ.fetch_add(1, Ordering::SeqCst);
    let dir = std::env::temp_dir().join(format!(
        "kibblet-dispatch-{}-{seq}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    [
        dir.join("recipes.json"),
        dir.join("recipes.bak1.json"),
        dir.join("recipes.bak2.json"),
    ]
}

fn rig() -> Rig {
    let clock = SimClock::new();
    let hub = Arc::new(DeviceHub::new());
    let broker = Arc::new(EventBroker::new());

    let completions: Arc<Mutex<Vec<(bool, f32)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = completions.clone();
    broker.subscribe(Topic::FeedingComplete, move |payload| {
        if let EventPayload::FeedingComplete { success, dispensed } = payload {
            sink.lock().push((*success, *dispensed));
        }
    });

    let errors: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    broker.subscribe(Topic::Error, move |payload| {
        if let EventPayload::Error { code, .. } = payload {
            sink.lock().push(code);
        }
    });

    let (hw, scale) = feeder_rig(
        clock.clone(),
        vec![
            SimTankSpec {
                uid: UID_A,
                channel: 0,
                density_g_per_l: 500.0,
                stock_g: 1000.0,
            },
            SimTankSpec {
                uid: UID_B,
                channel: 1,
                density_g_per_l: 600.0,
                stock_g: 1000.0,
            },
        ],
    );
    hw.state.lock().close_spike_at_us = Some(1400);

    let store = RecipeStore::new(temp_paths(), MemoryNvs::default());
    let engine = DispensingEngine::new(
        clock.clone(),
        hub.clone(),
        broker.clone(),
        1000,
        2000,
        3.0,
        10_000,
    );
    let dispatcher = FeedDispatcher::new(clock.clone(), hub.clone(), broker, engine, store);

    Rig {
        dispatcher,
        hw,
        scale,
        clock,
        hub,
        completions,
        errors,
    }
}

/// Drive the dispatcher until it settles (no active feed, empty inbox,
/// and a few quiet poll periods), or the budget runs out.
fn run_until_settled(rig: &mut Rig, budget_ms: u64) {
    let deadline = rig.clock.now_ms() + budget_ms;
    let mut quiet_ticks = 0u32;
    while quiet_ticks < 50 {
        rig.clock.advance_ms(10);
        rig.dispatcher.tick(&mut rig.hw, &mut rig.scale);

        let pending = rig
            .hub
            .with_state(|s| !s.inbox.processed)
            .unwrap_or(false);
        if !rig.dispatcher.is_feeding() && !pending {
            quiet_ticks += 1;
        } else {
            quiet_ticks = 0;
        }
        if rig.clock.now_ms() > deadline {
            panic!("dispatcher never settled");
        }
    }
}

fn seed_recipe(rig: &mut Rig, daily_weight_g: f32) -> u32 {
    rig.dispatcher
        .store_mut()
        .add_recipe(
            Recipe {
                uid: 0,
                name: "Mix".to_string(),
                daily_weight_g,
                servings: 2,
                created: 0,
                last_used: 0,
                enabled: true,
                ingredients: vec![
                    Ingredient {
                        tank_uid: UID_A,
                        percentage: 70.0,
                    },
                    Ingredient {
                        tank_uid: UID_B,
                        percentage: 30.0,
                    },
                ],
            },
            1,
        )
        .unwrap()
}

// ── Tare ──────────────────────────────────────────────────────

#[test]
fn tare_command_reaches_the_scale() {
    let mut rig = rig();
    rig.hub.submit_command(FeedCommand::TareScale).unwrap();
    run_until_settled(&mut rig, 10_000);

    assert_eq!(rig.hw.state.lock().tare_count, 1);
    rig.hub
        .with_state(|s| assert_eq!(s.feeding_status, FeedingStatus::Idle))
        .unwrap();
}

// ── Immediate feed ────────────────────────────────────────────

#[test]
fn immediate_feed_publishes_outcome_and_debits_stock() {
    let mut rig = rig();
    rig.hub
        .submit_command(FeedCommand::Immediate {
            tank_uid: UID_A,
            grams: 5.0,
        })
        .unwrap();
    run_until_settled(&mut rig, 600_000);

    let completions = rig.completions.lock();
    assert_eq!(completions.len(), 1);
    let (success, dispensed) = completions[0];
    assert!(success);
    assert!(dispensed >= 4.5);
    drop(completions);

    // Remaining mass was written back to the tank.
    let state = rig.hw.state.lock();
    assert_eq!(state.remaining_updates.len(), 1);
    let (uid, left) = state.remaining_updates[0];
    assert_eq!(uid, UID_A);
    assert!(left < 1000.0 && left > 990.0, "left {left}");
    drop(state);

    rig.hub
        .with_state(|s| {
            assert_eq!(s.feeding_status, FeedingStatus::Idle);
            assert!(s.last_feed_time_ms > 0);
            assert_eq!(s.feeding_history.len(), 1);
            let entry = &s.feeding_history[0];
            assert_eq!(entry.kind, "immediate");
            assert!(entry.success);
        })
        .unwrap();
}

// ── Recipe feed ───────────────────────────────────────────────

#[test]
fn recipe_feed_stamps_last_used() {
    let mut rig = rig();
    let uid = seed_recipe(&mut rig, 20.0); // 10 g per serving

    rig.hub
        .submit_command(FeedCommand::Recipe {
            recipe_uid: uid,
            servings: 1,
        })
        .unwrap();
    run_until_settled(&mut rig, 2_000_000);

    {
        let completions = rig.completions.lock();
        assert_eq!(completions.len(), 1);
        assert!(completions[0].0, "recipe feed should succeed");
    }
    let recipe = rig.dispatcher.store().recipe_by_uid(uid).unwrap();
    assert!(recipe.last_used > 0, "lastUsed not stamped");

    rig.hub
        .with_state(|s| {
            assert_eq!(s.last_recipe_uid, uid);
            assert_eq!(s.feeding_history[0].kind, "recipe");
        })
        .unwrap();
}

#[test]
fn unknown_recipe_fails_cleanly() {
    let mut rig = rig();
    rig.hub
        .submit_command(FeedCommand::Recipe {
            recipe_uid: 42,
            servings: 1,
        })
        .unwrap();
    run_until_settled(&mut rig, 30_000);

    let completions = rig.completions.lock();
    assert_eq!(completions.len(), 1);
    assert!(!completions[0].0);
    drop(completions);

    assert!(rig.errors.lock().contains(&"recipe_not_found"));
    rig.hub
        .with_state(|s| assert_eq!(s.feeding_status, FeedingStatus::Error))
        .unwrap();
}

// ── Safety interlock ──────────────────────────────────────────

#[test]
fn safety_engaged_rejects_feeds_until_cleared() {
    let mut rig = rig();
    rig.hub
        .with_state(|s| s.safety_mode_engaged = true)
        .unwrap();

    // Submission is refused outright.
    assert_eq!(
        rig.hub.submit_command(FeedCommand::Recipe {
            recipe_uid: 1,
            servings: 1
        }),
        Err(SubmitError::SafetyEngaged)
    );

    // After an explicit clear, feeding works again.
    rig.hub.clear_safety().unwrap();
    rig.hub
        .submit_command(FeedCommand::Immediate {
            tank_uid: UID_A,
            grams: 2.0,
        })
        .unwrap();
    run_until_settled(&mut rig, 600_000);
    assert_eq!(rig.completions.lock().len(), 1);
}

#[test]
fn flag_engaging_after_submission_still_blocks_routing() {
    let mut rig = rig();
    rig.hub
        .submit_command(FeedCommand::Immediate {
            tank_uid: UID_A,
            grams: 5.0,
        })
        .unwrap();
    // The flag flips before the dispatcher polls.
    rig.hub
        .with_state(|s| s.safety_mode_engaged = true)
        .unwrap();

    for _ in 0..100 {
        rig.clock.advance_ms(10);
        rig.dispatcher.tick(&mut rig.hw, &mut rig.scale);
    }
    assert!(!rig.dispatcher.is_feeding());
    assert!(rig.completions.lock().is_empty());
}

// ── Inbox ordering ────────────────────────────────────────────

#[test]
fn sequential_commands_process_in_order() {
    let mut rig = rig();
    for grams in [2.0f32, 3.0, 4.0] {
        rig.hub
            .submit_command(FeedCommand::Immediate {
                tank_uid: UID_A,
                grams,
            })
            .unwrap();
        run_until_settled(&mut rig, 600_000);
    }

    rig.hub
        .with_state(|s| {
            assert_eq!(s.feeding_history.len(), 3);
            let amounts: Vec<f32> = s.feeding_history.iter().map(|e| e.grams).collect();
            assert!(amounts[0] < amounts[1] && amounts[1] < amounts[2]);
        })
        .unwrap();
    assert_eq!(rig.completions.lock().len(), 3);
}
