//! Integration tests for the cdp-ledger engine.
//!
//! These tests drive both ledgers end to end through the public API.

use proptest::prelude::*;

use cdp_ledger::cli::{Scenario, ScenarioRunner};
use cdp_ledger::core::amount::{CollateralAmount, RewardAmount, TokenAmount};
use cdp_ledger::core::config::ProtocolParams;
use cdp_ledger::error::Error;
use cdp_ledger::liquidation::stability_pool::{PoolTransition, StabilityPool};
use cdp_ledger::protocol::{LedgerOperation, OperationOutcome, Protocol};
use cdp_ledger::storage::backend::{BinaryStore, FileStore, InMemoryStore, StorageBackend};
use cdp_ledger::utils::constants::{COLLATERAL_BASE_UNIT, SCALE_FACTOR, STABLE_BASE_UNIT};
use cdp_ledger::utils::hash::{AccountId, PositionId};
use cdp_ledger::utils::math::FixedPoint;

// ═══════════════════════════════════════════════════════════════════════════════
// TEST HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

/// Assert two base-unit amounts differ by at most `tolerance`
macro_rules! assert_fuzzy_eq {
    ($left:expr, $right:expr, $tolerance:expr) => {{
        let (left, right, tolerance): (u64, u64, u64) = ($left, $right, $tolerance);
        assert!(
            left.abs_diff(right) <= tolerance,
            "assert_fuzzy_eq failed: {} vs {} (tolerance {})",
            left,
            right,
            tolerance
        );
    }};
}

fn account(name: &str) -> AccountId {
    AccountId::from_name(name)
}

fn price(whole: u64) -> u64 {
    whole * STABLE_BASE_UNIT
}

fn protocol_at(price_whole: u64) -> Protocol<InMemoryStore> {
    let mut protocol = Protocol::ephemeral(ProtocolParams::default()).unwrap();
    protocol.set_price(price(price_whole)).unwrap();
    protocol
}

fn open(protocol: &mut Protocol<impl StorageBackend>, owner: &str, coll: u64, debt: u64) -> PositionId {
    protocol
        .open_position(
            account(owner),
            CollateralAmount::from_whole(coll),
            TokenAmount::from_whole(debt),
        )
        .unwrap()
}

// ═══════════════════════════════════════════════════════════════════════════════
// STABILITY POOL
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_three_depositors_share_one_liquidation() {
    let mut protocol = protocol_at(120);
    let depositors = ["carol", "dave", "erin"];
    for name in depositors {
        protocol.deposit(account(name), TokenAmount::from_whole(10_000)).unwrap();
    }
    let victim = open(&mut protocol, "vic", 200, 20_000);

    protocol.set_price(price(100)).unwrap();
    let event = protocol.liquidate(&victim).unwrap();

    assert!(event.fully_offset());
    assert_eq!(event.debt_offset, TokenAmount::from_whole(20_000));
    assert_eq!(event.collateral_to_pool, CollateralAmount::from_whole(200));
    assert_eq!(protocol.pool().total_deposits(), TokenAmount::from_whole(10_000));

    for name in depositors {
        let gains = protocol.depositor_gains(&account(name)).unwrap();
        // each keeps a third of the remaining 10,000, so loses ~6,666.67
        assert_fuzzy_eq!(gains.compounded.units(), 3_333_333_333, 1);
        let loss = TokenAmount::from_whole(10_000).units() - gains.compounded.units();
        assert_fuzzy_eq!(loss, 6_666_666_667, 1);
        // 66.67 collateral each
        assert_fuzzy_eq!(gains.collateral_gain.units(), 6_666_666_666, 1);
    }
    protocol.check_invariants().unwrap();
}

#[test]
fn test_epoch_refill_after_exact_depletion() {
    let mut protocol = protocol_at(120);
    let (alice, bob) = (account("alice"), account("bob"));

    protocol.deposit(alice, TokenAmount::from_whole(10_000)).unwrap();
    let first = open(&mut protocol, "vic1", 100, 10_000);
    let second = open(&mut protocol, "vic2", 60, 5_000);

    protocol.set_price(price(100)).unwrap();
    let event = protocol.liquidate(&first).unwrap();
    assert_eq!(event.pool_transition, PoolTransition::EpochAdvanced(1));
    assert_eq!(protocol.compounded_deposit(&alice).unwrap(), TokenAmount::ZERO);

    protocol.advance_block(2).unwrap();
    protocol.deposit(bob, TokenAmount::from_whole(5_000)).unwrap();
    assert_eq!(protocol.compounded_deposit(&bob).unwrap(), TokenAmount::from_whole(5_000));

    protocol.set_price(price(80)).unwrap();
    let event = protocol.liquidate(&second).unwrap();
    assert_eq!(event.pool_transition, PoolTransition::EpochAdvanced(2));

    // the epoch guard keeps alice at zero across the second emptying
    assert_eq!(protocol.compounded_deposit(&alice).unwrap(), TokenAmount::ZERO);
    assert_eq!(protocol.compounded_deposit(&bob).unwrap(), TokenAmount::ZERO);

    // bob only sees the second liquidation's collateral
    let bob_gains = protocol.depositor_gains(&bob).unwrap();
    assert_eq!(bob_gains.collateral_gain, CollateralAmount::from_whole(60));
    let alice_gains = protocol.depositor_gains(&alice).unwrap();
    assert_eq!(alice_gains.collateral_gain, CollateralAmount::from_whole(100));
    protocol.check_invariants().unwrap();
}

#[test]
fn test_full_depletion_resets_product() {
    let mut pool = StabilityPool::new();
    pool.deposit(account("alice"), TokenAmount::from_whole(700), 1).unwrap();
    pool.offset(TokenAmount::from_whole(300), CollateralAmount::from_whole(3)).unwrap();
    assert!(pool.p() < FixedPoint::ONE);

    let outcome = pool
        .offset(TokenAmount::from_whole(400), CollateralAmount::from_whole(4))
        .unwrap();

    assert_eq!(outcome.transition, PoolTransition::EpochAdvanced(1));
    assert_eq!(pool.p(), FixedPoint::ONE);
    assert_eq!(pool.current_scale(), 0);
    assert!(pool.total_deposits().is_zero());

    // a fresh deposit in the new epoch is worth its face value
    pool.deposit(account("bob"), TokenAmount::from_whole(50), 2).unwrap();
    assert_eq!(
        pool.get_compounded_deposit(&account("bob")).unwrap(),
        TokenAmount::from_whole(50)
    );
    // both offsets' collateral, short by at most the floors
    let alice_gain = pool.get_collateral_gain(&account("alice")).unwrap();
    assert!(alice_gain <= CollateralAmount::from_whole(7));
    assert_fuzzy_eq!(alice_gain.units(), 7 * COLLATERAL_BASE_UNIT, 3);
}

#[test]
fn test_scale_crossing_preserves_deposits() {
    let initial = 1_000_000_000_000_000u64;
    let mut pool = StabilityPool::new();
    pool.deposit(account("alice"), TokenAmount::from_units(initial), 1).unwrap();

    let outcome = pool
        .offset(
            TokenAmount::from_units(initial - initial / SCALE_FACTOR as u64),
            CollateralAmount::from_whole(1),
        )
        .unwrap();
    assert_eq!(outcome.transition, PoolTransition::ScaleAdvanced(1));

    // a deposit made after the crossing is not diluted by it
    pool.deposit(account("bob"), TokenAmount::from_whole(1_000), 2).unwrap();
    let bob = pool.get_compounded_deposit(&account("bob")).unwrap();
    assert_fuzzy_eq!(bob.units(), TokenAmount::from_whole(1_000).units(), 1);

    let alice = pool.get_compounded_deposit(&account("alice")).unwrap();
    assert_fuzzy_eq!(alice.units(), initial / SCALE_FACTOR as u64, 1);

    // a later offset still splits by compounded deposit
    pool.offset(TokenAmount::from_whole(500), CollateralAmount::from_whole(2)).unwrap();
    let total = pool.total_deposits().units();
    let sum = pool.get_compounded_deposit(&account("alice")).unwrap().units()
        + pool.get_compounded_deposit(&account("bob")).unwrap().units();
    assert!(sum <= total);
    assert_fuzzy_eq!(sum, total, 3);
}

#[test]
fn test_reward_follows_compounded_share() {
    let mut protocol = protocol_at(2_000);
    protocol.deposit(account("alice"), TokenAmount::from_whole(300)).unwrap();
    protocol.deposit(account("bob"), TokenAmount::from_whole(100)).unwrap();

    let issued = protocol.issue_reward(RewardAmount::from_whole(40)).unwrap();
    assert_eq!(issued, RewardAmount::from_whole(40));

    let alice = protocol.claim_gains(&account("alice")).unwrap();
    let bob = protocol.claim_gains(&account("bob")).unwrap();
    assert_fuzzy_eq!(alice.reward_gain.units(), RewardAmount::from_whole(30).units(), 1);
    assert_fuzzy_eq!(bob.reward_gain.units(), RewardAmount::from_whole(10).units(), 1);

    // claimed gains are gone
    let again = protocol.claim_gains(&account("alice")).unwrap();
    assert!(again.reward_gain.is_zero());
}

// ═══════════════════════════════════════════════════════════════════════════════
// REDISTRIBUTION
// ═══════════════════════════════════════════════════════════════════════════════

/// Pool covers 1,000 of an 1,800 debt; 800 goes to bob (stake 10) and carol (stake 5)
fn partially_offset_protocol() -> (Protocol<InMemoryStore>, PositionId, PositionId) {
    let mut protocol = protocol_at(2_000);
    protocol.deposit(account("sp"), TokenAmount::from_whole(1_000)).unwrap();
    let victim = open(&mut protocol, "victim", 1, 1_800);
    let bob = open(&mut protocol, "bob", 10, 1_000);
    let carol = open(&mut protocol, "carol", 5, 500);

    protocol.set_price(price(1_500)).unwrap();
    let event = protocol.liquidate(&victim).unwrap();
    assert_eq!(event.debt_redistributed, TokenAmount::from_whole(800));
    (protocol, bob, carol)
}

#[test]
fn test_redistribution_proportional_to_stake() {
    let (protocol, bob, carol) = partially_offset_protocol();

    let bob_pending = protocol.positions().pending_rewards(&bob).unwrap();
    let carol_pending = protocol.positions().pending_rewards(&carol).unwrap();

    assert_fuzzy_eq!(bob_pending.debt.units(), 533_333_333, 1);
    assert_fuzzy_eq!(carol_pending.debt.units(), 266_666_666, 1);
    assert_fuzzy_eq!(bob_pending.debt.units(), 2 * carol_pending.debt.units(), 2);
    assert_fuzzy_eq!(bob_pending.collateral.units(), 2 * carol_pending.collateral.units(), 2);
}

#[test]
fn test_redistribution_conserves_totals() {
    let (protocol, bob, carol) = partially_offset_protocol();
    let stats = protocol.positions().statistics(price(1_500));

    assert_eq!(stats.total_debt, TokenAmount::from_whole(2_300));
    assert_eq!(stats.pending_debt, TokenAmount::from_whole(800));

    let owed: u64 = [bob, carol]
        .iter()
        .map(|id| protocol.entire_debt_and_collateral(id).unwrap().debt.units())
        .sum();
    assert!(owed <= stats.total_debt.units());
    assert_fuzzy_eq!(owed, stats.total_debt.units(), 2);
    protocol.check_invariants().unwrap();
}

#[test]
fn test_applying_rewards_is_idempotent() {
    let (mut protocol, bob, _) = partially_offset_protocol();

    let before = protocol.entire_debt_and_collateral(&bob).unwrap();
    // reading is pure
    assert_eq!(protocol.entire_debt_and_collateral(&bob).unwrap(), before);

    let first = protocol.add_collateral(&bob, CollateralAmount::from_units(1)).unwrap();
    assert_eq!(first.applied, before.pending);
    assert_eq!(first.debt, before.debt);

    let second = protocol.repay(&bob, TokenAmount::from_whole(1)).unwrap();
    assert!(second.applied.is_zero());
    assert_eq!(second.debt, before.debt.saturating_sub(TokenAmount::from_whole(1)));
    assert!(protocol.positions().pending_rewards(&bob).unwrap().is_zero());
    protocol.check_invariants().unwrap();
}

#[test]
fn test_last_position_cannot_absorb_remainder() {
    let mut protocol = protocol_at(2_000);
    let victim = open(&mut protocol, "victim", 1, 1_800);
    protocol.set_price(price(1_500)).unwrap();

    let result = protocol.liquidate(&victim);
    assert!(matches!(result, Err(Error::LastPosition(_))));
    assert!(protocol.position(&victim).unwrap().is_active());
    assert!(protocol.events().filter_by_type("PositionLiquidated").is_empty());
}

#[test]
fn test_stakes_recover_after_every_position_is_liquidated() {
    let mut protocol = protocol_at(2_000);
    let a = open(&mut protocol, "a", 1, 1_000);
    let b = open(&mut protocol, "b", 1, 1_000);
    let c = open(&mut protocol, "c", 1, 1_800);
    let d = open(&mut protocol, "d", 1, 1_000);

    // One collateral over three equal stakes leaves a unit of dust pending
    protocol.set_price(price(1_900)).unwrap();
    let event = protocol.liquidate(&c).unwrap();
    assert_eq!(event.collateral_redistributed, CollateralAmount::from_whole(1));

    protocol.deposit(account("sp"), TokenAmount::from_whole(100_000)).unwrap();
    protocol.set_price(price(1_000)).unwrap();
    for id in [a, b, d] {
        assert!(protocol.liquidate(&id).unwrap().fully_offset());
    }

    let ledger = protocol.positions().ledger();
    assert_eq!(ledger.total_stakes, 0);
    assert_eq!(ledger.total_stakes_snapshot, 0);
    assert_eq!(ledger.pending_collateral, CollateralAmount::from_units(1));

    protocol.set_price(price(2_000)).unwrap();
    let e = open(&mut protocol, "e", 10, 1_000);
    let g = open(&mut protocol, "g", 1, 1_800);
    assert_eq!(protocol.position(&e).unwrap().stake, 10 * COLLATERAL_BASE_UNIT);
    assert_eq!(protocol.positions().ledger().total_stakes, 11 * COLLATERAL_BASE_UNIT);

    // With the pool drained, g's debt goes to e
    protocol.withdraw_all(&account("sp")).unwrap();
    protocol.set_price(price(1_900)).unwrap();
    let event = protocol.liquidate(&g).unwrap();
    assert!(event.debt_redistributed > TokenAmount::from_whole(1_799));

    let pending = protocol.positions().pending_rewards(&e).unwrap();
    assert_fuzzy_eq!(pending.debt.units(), event.debt_redistributed.units(), 1);
    protocol.check_invariants().unwrap();
}

// ═══════════════════════════════════════════════════════════════════════════════
// LIQUIDATION ORCHESTRATOR
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_offset_then_redistribute_split() {
    let (protocol, _, _) = partially_offset_protocol();
    let event = &protocol.engine().recent_events()[0];

    assert_eq!(event.debt, event.debt_offset.saturating_add(event.debt_redistributed));
    assert_eq!(
        event.collateral,
        event.collateral_to_pool.saturating_add(event.collateral_redistributed)
    );
    // 1,000 of 1,800 debt takes 5/9 of one collateral, floored
    assert_eq!(event.collateral_to_pool, CollateralAmount::from_units(55_555_555));
    assert_eq!(protocol.pool().collateral_balance(), event.collateral_to_pool);
}

#[test]
fn test_healthy_position_is_refused() {
    let mut protocol = protocol_at(2_000);
    protocol.deposit(account("sp"), TokenAmount::from_whole(5_000)).unwrap();
    let safe = open(&mut protocol, "safe", 1, 1_000);

    assert!(matches!(protocol.liquidate(&safe), Err(Error::PositionHealthy(_))));
    assert!(protocol.execute(LedgerOperation::LiquidateAll).is_ok());
    assert_eq!(protocol.positions().active_count(), 1);
}

#[test]
fn test_liquidate_all_through_operations() {
    let mut protocol = protocol_at(2_000);
    protocol.deposit(account("sp"), TokenAmount::from_whole(10_000)).unwrap();
    open(&mut protocol, "a", 1, 1_700);
    open(&mut protocol, "b", 1, 1_600);
    open(&mut protocol, "safe", 10, 1_000);

    protocol
        .execute(LedgerOperation::SetPrice { price: price(1_700) })
        .unwrap();
    let outcome = protocol.execute(LedgerOperation::LiquidateAll).unwrap();

    match outcome {
        OperationOutcome::Liquidated(events) => {
            assert_eq!(events.len(), 2);
            assert!(events.iter().all(|e| e.fully_offset()));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(protocol.engine().statistics().total_liquidations, 2);
    protocol.check_invariants().unwrap();
}

// ═══════════════════════════════════════════════════════════════════════════════
// PERSISTENCE
// ═══════════════════════════════════════════════════════════════════════════════

fn persisted_roundtrip<B: StorageBackend>(make: impl Fn(&std::path::Path) -> B) {
    let dir = tempfile::tempdir().unwrap();
    let (pool_hash, ledger_hash, bob) = {
        let (protocol, bob, _) = partially_offset_protocol();
        let mut persisted = Protocol::create(make(dir.path()), protocol.params().clone()).unwrap();
        // replay the same history on the persisted ledger
        persisted.set_price(price(2_000)).unwrap();
        persisted.deposit(account("sp"), TokenAmount::from_whole(1_000)).unwrap();
        let victim = open(&mut persisted, "victim", 1, 1_800);
        let bob_id = open(&mut persisted, "bob", 10, 1_000);
        open(&mut persisted, "carol", 5, 500);
        persisted.set_price(price(1_500)).unwrap();
        persisted.liquidate(&victim).unwrap();

        assert_eq!(bob_id, bob);
        protocol.check_invariants().unwrap();
        let meta = persisted.save().unwrap();
        assert_eq!(meta.pool_hash, protocol.pool().state_hash().unwrap());
        (meta.pool_hash, meta.ledger_hash, bob)
    };

    let reopened = Protocol::open(make(dir.path())).unwrap();
    assert_eq!(reopened.pool().state_hash().unwrap(), pool_hash);
    assert_eq!(reopened.positions().ledger().state_hash().unwrap(), ledger_hash);
    assert_eq!(reopened.price(), Some(price(1_500)));
    assert!(!reopened.positions().pending_rewards(&bob).unwrap().is_zero());
    reopened.check_invariants().unwrap();
}

#[test]
fn test_file_store_roundtrip() {
    persisted_roundtrip(|path| FileStore::new(path).unwrap());
}

#[test]
fn test_binary_store_roundtrip() {
    persisted_roundtrip(|path| BinaryStore::new(path).unwrap());
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCENARIO REPLAY
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_replay_scenario_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("three.json");
    std::fs::write(
        &path,
        r#"{
            "name": "three depositors",
            "steps": [
                { "action": "price", "price": "120" },
                { "action": "deposit", "account": "carol", "amount": "10000" },
                { "action": "deposit", "account": "dave", "amount": "10000" },
                { "action": "deposit", "account": "erin", "amount": "10000" },
                { "action": "open", "account": "vic", "label": "v", "collateral": "200", "debt": "20000" },
                { "action": "price", "price": "100" },
                { "action": "liquidate_all" },
                { "action": "expect_deposit", "account": "dave", "amount": "3333.333333", "tolerance": "0.000001" },
                { "action": "expect_collateral_gain", "account": "erin", "amount": "66.66666666", "tolerance": "0.00000001" },
                { "action": "withdraw", "account": "carol" },
                { "action": "expect_deposit", "account": "carol", "amount": "0" }
            ]
        }"#,
    )
    .unwrap();

    let scenario = Scenario::load(&path).unwrap();
    let mut protocol = Protocol::ephemeral(ProtocolParams::default()).unwrap();
    let reports = ScenarioRunner::new()
        .run(&mut protocol, &scenario, |_| {})
        .unwrap();

    assert_eq!(reports.len(), 11);
    assert_eq!(protocol.pool().depositor_count(), 2);
    protocol.check_invariants().unwrap();
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROPERTIES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
enum PoolAction {
    Deposit { who: usize, whole: u64 },
    Withdraw { who: usize, percent: u64 },
    Offset { percent: u64, collateral: u64 },
}

fn pool_action() -> impl Strategy<Value = PoolAction> {
    prop_oneof![
        (0..4usize, 1..100_000u64).prop_map(|(who, whole)| PoolAction::Deposit { who, whole }),
        (0..4usize, 1..=100u64).prop_map(|(who, percent)| PoolAction::Withdraw { who, percent }),
        (1..=100u64, 0..1_000 * COLLATERAL_BASE_UNIT)
            .prop_map(|(percent, collateral)| PoolAction::Offset { percent, collateral }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_pool_conservation(actions in prop::collection::vec(pool_action(), 1..40)) {
        let depositors: Vec<AccountId> = (0..4).map(|i| account(&format!("d{}", i))).collect();
        let mut pool = StabilityPool::new();
        let mut block = 1;

        for action in actions {
            block += 1;
            match action {
                PoolAction::Deposit { who, whole } => {
                    pool.deposit(depositors[who], TokenAmount::from_whole(whole), block).unwrap();
                }
                PoolAction::Withdraw { who, percent } => {
                    let compounded = pool.get_compounded_deposit(&depositors[who]).unwrap().units();
                    let amount = compounded * percent / 100;
                    if amount > 0 {
                        pool.withdraw(&depositors[who], TokenAmount::from_units(amount), block).unwrap();
                    }
                }
                PoolAction::Offset { percent, collateral } => {
                    let total = pool.total_deposits().units();
                    if total > 0 {
                        let debt = total * percent / 100;
                        pool.offset(TokenAmount::from_units(debt), CollateralAmount::from_units(collateral)).unwrap();
                    }
                }
            }

            let compounded: u64 = depositors
                .iter()
                .map(|d| pool.get_compounded_deposit(d).unwrap().units())
                .sum();
            prop_assert!(compounded <= pool.total_deposits().units());

            let gains: u64 = depositors
                .iter()
                .map(|d| pool.get_collateral_gain(d).unwrap().units())
                .sum();
            prop_assert!(gains <= pool.collateral_balance().units());
        }
    }

    #[test]
    fn prop_pool_proportionality(
        a in 1..1_000_000u64,
        b in 1..1_000_000u64,
        percent in 1..100u64,
        collateral in 1..10_000 * COLLATERAL_BASE_UNIT,
    ) {
        let (alice, bob) = (account("alice"), account("bob"));
        let mut pool = StabilityPool::new();
        pool.deposit(alice, TokenAmount::from_whole(a), 1).unwrap();
        pool.deposit(bob, TokenAmount::from_whole(b), 1).unwrap();

        let total = pool.total_deposits().units();
        pool.offset(
            TokenAmount::from_units(total * percent / 100),
            CollateralAmount::from_units(collateral),
        ).unwrap();

        let (a_units, b_units) = (
            TokenAmount::from_whole(a).units() as u128,
            TokenAmount::from_whole(b).units() as u128,
        );
        let ca = pool.get_compounded_deposit(&alice).unwrap().units() as u128;
        let cb = pool.get_compounded_deposit(&bob).unwrap().units() as u128;
        // ca / a == cb / b up to one base unit of flooring on each side
        prop_assert!((ca * b_units).abs_diff(cb * a_units) <= a_units + b_units);

        let ga = pool.get_collateral_gain(&alice).unwrap().units() as u128;
        let gb = pool.get_collateral_gain(&bob).unwrap().units() as u128;
        prop_assert!((ga * b_units).abs_diff(gb * a_units) <= a_units + b_units);
        prop_assert!(ga + gb <= collateral as u128);
    }
}
