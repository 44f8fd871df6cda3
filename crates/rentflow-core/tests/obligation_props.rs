//! Property tests: obligation state changes through the store.

use chrono::Utc;
use proptest::prelude::*;
use rentflow_core::*;

fn arb_state() -> impl Strategy<Value = ObligationState> {
    prop_oneof![
        Just(ObligationState::Pending),
        Just(ObligationState::Submitting),
        Just(ObligationState::Submitted),
        Just(ObligationState::Settled),
        Just(ObligationState::Failed),
    ]
}

fn pending_row() -> PaymentObligation {
    let now = Utc::now();
    PaymentObligation {
        obligation_id: "ob-prop".to_string(),
        lease_id: "lease-prop".to_string(),
        kind: ObligationKind::Deposit,
        payer_id: "tenant-p".to_string(),
        payee_id: "landlord-p".to_string(),
        amount_minor: 1_000_000,
        currency: CurrencyUnit::usdc(),
        due_reference: "lease-prop:deposit".to_string(),
        state: ObligationState::Pending,
        rail: None,
        external_reference: None,
        failure_reason: None,
        settled_at: None,
        replaces: None,
        created_at: now,
        updated_at: now,
    }
}

fn patch_for(to: ObligationState) -> ObligationPatch {
    match to {
        ObligationState::Submitted => ObligationPatch::submitted("prop", "tx-prop"),
        ObligationState::Settled => ObligationPatch::settled(Utc::now()),
        ObligationState::Failed => ObligationPatch::failed("prop failure"),
        _ => ObligationPatch::default(),
    }
}

proptest! {
    /// Terminal states admit no outgoing transition.
    #[test]
    fn terminal_states_have_no_successor(from in arb_state(), to in arb_state()) {
        if from.is_terminal() {
            prop_assert!(!from.can_transition_to(to));
        }
    }

    /// Whatever sequence of conditional updates arrives, a terminal row never
    /// changes again and the submission slot is taken at most once.
    #[test]
    fn conditional_updates_respect_terminal_states(
        attempts in prop::collection::vec((arb_state(), arb_state()), 1..40)
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime.block_on(async {
            let store = InMemorySettlementStore::new();
            store.insert_obligations(&[pending_row()]).await.unwrap();

            let mut terminal: Option<ObligationState> = None;
            let mut slot_taken = 0;
            for (from, to) in attempts {
                let result = store
                    .transition_obligation("ob-prop", from, to, patch_for(to))
                    .await;
                if result.is_ok() && from == ObligationState::Pending {
                    slot_taken += 1;
                }

                let current = store.get_obligation("ob-prop").await.unwrap().unwrap().state;
                if let Some(settled_state) = terminal {
                    assert_eq!(current, settled_state);
                    assert!(result.is_err());
                }
                if current.is_terminal() {
                    terminal = Some(current);
                }
            }
            assert!(slot_taken <= 1);
        });
    }
}
