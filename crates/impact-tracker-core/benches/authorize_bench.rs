use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use impact_tracker_core::{
    authorize_join, Action, JoinId, JoinKind, JoinRecord, NodeId, Principal, PrincipalId, Role,
};
use time::OffsetDateTime;
use ulid::Ulid;

fn fixture_principal(role: Role) -> Principal {
    Principal {
        id: PrincipalId::new(),
        email: format!("{}@example.org", role.as_str()),
        name: role.as_str().to_string(),
        role,
        created_at: OffsetDateTime::UNIX_EPOCH,
        updated_at: OffsetDateTime::UNIX_EPOCH,
        relationship_updated_at: None,
        relationship_updated_by_id: None,
        archived_at: None,
    }
}

fn fixture_join(owner: Option<PrincipalId>) -> JoinRecord {
    JoinRecord {
        id: JoinId::new(),
        kind: JoinKind::Membership,
        left_id: NodeId(Ulid::new()),
        right_id: NodeId(Ulid::new()),
        value: None,
        created_by_id: owner,
        created_at: OffsetDateTime::UNIX_EPOCH,
        updated_at: OffsetDateTime::UNIX_EPOCH,
    }
}

fn bench_authorize(c: &mut Criterion) {
    let principals: Vec<Principal> = Role::all().into_iter().map(fixture_principal).collect();

    c.bench_function("authorize_join_destroy_matrix", |b| {
        b.iter_batched(
            || {
                principals
                    .iter()
                    .map(|principal| (principal.clone(), fixture_join(Some(principal.id))))
                    .collect::<Vec<_>>()
            },
            |cases| {
                for (principal, join) in &cases {
                    let _ = authorize_join(Some(principal), Action::Destroy, Some(join));
                    let _ = authorize_join(Some(principal), Action::Create, None);
                }
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_authorize);
criterion_main!(benches);
