use std::collections::BTreeSet;

use proptest::prelude::*;

use listorder::{
    core::{error::StoreError, store::Store, txn::Transaction},
    types::{CheckMode, Position},
};

const MEMBERS: usize = 6;
const CONTAINERS: [&str; 2] = ["north", "south"];

#[derive(Debug, Clone)]
enum Action {
    Add { container: u8, member: u8, position: u8 },
    Move { container: u8, member: u8, position: u8 },
    Remove { container: u8, member: u8 },
    Swap { container: u8, a: u8, b: u8 },
}

fn action_strategy() -> impl Strategy<Value = Action> {
    let member = 0u8..MEMBERS as u8;
    let container = 0u8..CONTAINERS.len() as u8;
    prop_oneof![
        (container.clone(), member.clone(), 0u8..8)
            .prop_map(|(container, member, position)| Action::Add { container, member, position }),
        (container.clone(), member.clone(), 0u8..8)
            .prop_map(|(container, member, position)| Action::Move { container, member, position }),
        (container.clone(), member.clone())
            .prop_map(|(container, member)| Action::Remove { container, member }),
        (container, member.clone(), member).prop_map(|(container, a, b)| Action::Swap { container, a, b }),
    ]
}

/// A batch of actions run in one transaction, then committed or aborted.
#[derive(Debug, Clone)]
struct Batch {
    actions: Vec<Action>,
    commit: bool,
}

fn batch_strategy() -> impl Strategy<Value = Batch> {
    (prop::collection::vec(action_strategy(), 1..5), any::<bool>())
        .prop_map(|(actions, commit)| Batch { actions, commit })
}

fn member_name(idx: u8) -> String {
    format!("m{idx}")
}

fn seeded() -> Store {
    let store = Store::new();
    let mut txn = store.begin();
    for name in CONTAINERS {
        txn.create_container(name).expect("container");
    }
    for idx in 0..MEMBERS as u8 {
        txn.create_member(member_name(idx), format!("item {idx}")).expect("member");
    }
    txn.commit().expect("seed");
    drop(txn);
    store
}

fn layout(store: &Store, container: &str) -> Vec<(String, Position)> {
    store
        .list_ordered(container)
        .expect("list")
        .map(|e| (e.member.name, e.position))
        .collect()
}

fn assert_unique_positions(store: &Store) {
    for name in CONTAINERS {
        let positions: Vec<Position> = layout(store, name).into_iter().map(|(_, p)| p).collect();
        let distinct: BTreeSet<Position> = positions.iter().copied().collect();
        assert_eq!(positions.len(), distinct.len(), "duplicate position in {name}: {positions:?}");
    }
}

fn run(txn: &mut Transaction<'_>, action: &Action) -> Result<(), StoreError> {
    match action {
        Action::Add { container, member, position } => txn.add_membership(
            CONTAINERS[*container as usize],
            member_name(*member).as_str(),
            Position::from(*position),
        ),
        Action::Move { container, member, position } => txn.set_position(
            CONTAINERS[*container as usize],
            member_name(*member).as_str(),
            Position::from(*position),
        ),
        Action::Remove { container, member } => {
            txn.remove_membership(CONTAINERS[*container as usize], member_name(*member).as_str())
        }
        Action::Swap { container, a, b } => txn.swap(
            CONTAINERS[*container as usize],
            member_name(*a).as_str(),
            member_name(*b).as_str(),
        ),
    }
}

proptest! {
    #[test]
    fn committed_state_never_holds_duplicate_positions(batches in prop::collection::vec(batch_strategy(), 1..40)) {
        let store = seeded();

        for batch in batches {
            let before = store.export_snapshot();
            let mut txn = store.begin();
            let mut failed = false;
            for action in &batch.actions {
                if run(&mut txn, action).is_err() {
                    failed = true;
                    break;
                }
            }

            if failed || !batch.commit {
                txn.abort();
                prop_assert_eq!(store.export_snapshot(), before);
            } else {
                match txn.commit() {
                    Ok(seq) => prop_assert!(seq == before.seq || seq == before.seq + 1),
                    Err(StoreError::ConstraintViolation(_)) => {
                        prop_assert_eq!(store.export_snapshot(), before);
                    }
                    Err(other) => prop_assert!(false, "unexpected commit error: {other:?}"),
                }
            }
            assert_unique_positions(&store);
        }
    }

    #[test]
    fn swapping_twice_restores_the_layout(
        positions in prop::collection::btree_set(0u64..50, MEMBERS),
        a in 0u8..MEMBERS as u8,
        b in 0u8..MEMBERS as u8,
    ) {
        let store = seeded();
        let mut txn = store.begin();
        for (idx, position) in positions.iter().enumerate() {
            txn.add_membership("north", member_name(idx as u8).as_str(), *position).expect("add");
        }
        txn.commit().expect("layout");
        let original = layout(&store, "north");

        store.swap("north", member_name(a).as_str(), member_name(b).as_str()).expect("first swap");
        store.swap("north", member_name(a).as_str(), member_name(b).as_str()).expect("second swap");

        prop_assert_eq!(layout(&store, "north"), original);
    }

    #[test]
    fn swap_is_symmetric_and_immediate_mode_rejects_it(
        positions in prop::collection::btree_set(0u64..50, MEMBERS),
        a in 0u8..MEMBERS as u8,
        b in 0u8..MEMBERS as u8,
    ) {
        let forward = seeded();
        let backward = seeded();
        for store in [&forward, &backward] {
            let mut txn = store.begin();
            for (idx, position) in positions.iter().enumerate() {
                txn.add_membership("north", member_name(idx as u8).as_str(), *position).expect("add");
            }
            txn.commit().expect("layout");
        }

        forward.swap("north", member_name(a).as_str(), member_name(b).as_str()).expect("swap a b");
        backward.swap("north", member_name(b).as_str(), member_name(a).as_str()).expect("swap b a");
        prop_assert_eq!(layout(&forward, "north"), layout(&backward, "north"));

        let mut strict = forward.begin_with(CheckMode::Immediate);
        let rejected = strict.swap("north", member_name(a).as_str(), member_name(b).as_str());
        prop_assert!(matches!(rejected, Err(StoreError::InvalidState(_))));
    }
}
