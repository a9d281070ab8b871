use std::error::Error;

use tracker_core::{
    AssignmentStatus, Epoch, GlobalId, PairingStatus, StatusChange, StatusCommand, Target,
    TeamStatus,
};
use tracker_engine::{EngineError, EntityLifecycle, Push, SyncEngine};
use tracker_harness::{TestNetwork, state_digest};
use tracker_storage::{SqliteStore, Store};

// ============================================================================
// End-to-end
// ============================================================================

#[test]
fn team_assignment_cycle_reaches_every_replica() -> Result<(), Box<dyn Error>> {
    let mut net = TestNetwork::new()?;
    let mut field = net.add_peer("field-1")?;

    // Created while the host is out of reach: stays tentative.
    net.set_online(false);
    let team = field.replica.create_team("101", "GROUND")?;
    assert!(team.tid.is_tentative());
    assert_eq!(field.replica.outbox().len(), 1);

    net.set_online(true);
    let report = field.replica.flush()?;
    assert_eq!(report.finalized, 1);
    let team = field.replica.lifecycle().team_at(team.n)?.ok_or("team row missing")?;
    assert_eq!(team.tid, GlobalId::new(1));

    // Queued only; the host sees it on the next flush.
    let assignment = field.replica.create_assignment("AA", "GROUND")?;
    assert!(assignment.aid.is_tentative());
    assert!(net.host().lifecycle().assignments()?.is_empty());
    field.replica.flush()?;
    let assignment = field
        .replica
        .lifecycle()
        .assignment_at(assignment.n)?
        .ok_or("assignment row missing")?;
    assert_eq!(assignment.aid, GlobalId::new(1));

    let pairing = field.confirmed_pairing(assignment.aid, team.tid)?;
    assert_eq!(pairing.pid, GlobalId::new(1));
    assert_eq!(pairing.status, PairingStatus::Current);
    {
        let host = net.host();
        let lifecycle = host.lifecycle();
        assert_eq!(lifecycle.team(team.tid)?.ok_or("host team")?.status, TeamStatus::Assigned);
        assert_eq!(
            lifecycle.assignment(assignment.aid)?.ok_or("host assignment")?.status,
            AssignmentStatus::Assigned
        );
    }

    let closed = field.replica.close_pairing(pairing.pid)?;
    assert_eq!(closed.status, PairingStatus::Previous);
    assert_eq!(closed.name_save.as_deref(), Some("101"));
    assert_eq!(closed.resource_save.as_deref(), Some("GROUND"));
    field.replica.flush()?;

    // A second replica starting from nothing sees the final state.
    let observer = net.add_peer("field-2")?;
    let lifecycle = observer.replica.lifecycle();
    let teams = lifecycle.teams()?;
    let assignments = lifecycle.assignments()?;
    let pairings = lifecycle.pairings()?;
    assert_eq!(teams.len(), 1);
    assert_eq!(teams[0].status, TeamStatus::Unassigned);
    assert_eq!(assignments.len(), 1);
    assert_eq!(assignments[0].status, AssignmentStatus::Completed);
    assert_eq!(pairings.len(), 1);
    assert_eq!(pairings[0].status, PairingStatus::Previous);
    assert_eq!(pairings[0].name_save.as_deref(), Some("101"));
    assert_eq!(pairings[0].resource_save.as_deref(), Some("GROUND"));

    // create team, create assignment, paired, team unassigned,
    // assignment completed, pairing closed
    let history = lifecycle.history().all()?;
    assert_eq!(history.len(), 6);
    assert!(history.iter().all(|entry| entry.recorded_by == "base"));

    field.replica.pull()?;
    let host_digest = net.host_digest()?;
    assert_eq!(field.digest()?, host_digest);
    assert_eq!(observer.digest()?, host_digest);
    Ok(())
}

#[test]
fn host_side_edits_reach_replicas() -> Result<(), Box<dyn Error>> {
    let mut net = TestNetwork::new()?;
    let mut field = net.add_peer("field-1")?;

    let (tid, aid) = {
        let mut host = net.host();
        let lifecycle = host.lifecycle_mut();
        let team = lifecycle.create_team("101", "GROUND")?;
        let assignment = lifecycle.create_assignment("AA", "K9 (HRD)")?;
        lifecycle.set_medical(team.tid, true)?;
        lifecycle.set_intended_resource(assignment.aid, "GROUND")?;
        (team.tid, assignment.aid)
    };

    let report = field.replica.pull()?;
    assert_eq!(report.inserted, 2);
    let team = field.replica.lifecycle().team(tid)?.ok_or("team")?;
    assert!(team.medical);
    let assignment = field.replica.lifecycle().assignment(aid)?.ok_or("assignment")?;
    assert_eq!(assignment.intended_resource, "GROUND");
    assert_eq!(field.digest()?, net.host_digest()?);
    Ok(())
}

// ============================================================================
// Merge properties
// ============================================================================

fn busy_host(net: &TestNetwork) -> Result<(), EngineError> {
    let mut host = net.host();
    let lifecycle = host.lifecycle_mut();
    let a = lifecycle.create_team("101", "GROUND")?;
    let b = lifecycle.create_team("102", "K9 (AREA)")?;
    let x = lifecycle.create_assignment("AA", "GROUND")?;
    let y = lifecycle.create_assignment("AB", "K9 (AREA)")?;
    lifecycle.create_pairing(x.aid, a.tid)?;
    let p = lifecycle.create_pairing(y.aid, b.tid)?;
    lifecycle.set_status(Target::team(a.tid), StatusChange::Team(TeamStatus::Working), Push::Now)?;
    lifecycle.close_pairing(p.pid)?;
    lifecycle.delete(Target::team(b.tid))?;
    Ok(())
}

#[test]
fn applying_the_same_delta_twice_changes_nothing() -> Result<(), Box<dyn Error>> {
    let net = TestNetwork::new()?;
    busy_host(&net)?;
    let delta = net.host().pull_since(Epoch::ZERO)?;

    let mut client = EntityLifecycle::client(SqliteStore::open_in_memory()?, "field");
    let mut sync = SyncEngine::new();
    sync.apply(&mut client, delta.clone())?;
    let once = state_digest(&client)?;

    let again = sync.apply(&mut client, delta)?;
    assert_eq!(again.inserted, 0);
    assert_eq!(again.history_added, 0);
    assert_eq!(state_digest(&client)?, once);
    assert_eq!(once, net.host_digest()?);
    Ok(())
}

#[test]
fn row_order_within_a_delta_does_not_matter() -> Result<(), Box<dyn Error>> {
    let net = TestNetwork::new()?;
    busy_host(&net)?;
    let delta = net.host().pull_since(Epoch::ZERO)?;
    let mut reversed = delta.clone();
    reversed.teams.reverse();
    reversed.assignments.reverse();
    reversed.pairings.reverse();
    reversed.history.reverse();

    let mut forward = EntityLifecycle::client(SqliteStore::open_in_memory()?, "a");
    let mut backward = EntityLifecycle::client(SqliteStore::open_in_memory()?, "b");
    SyncEngine::new().apply(&mut forward, delta)?;
    SyncEngine::new().apply(&mut backward, reversed)?;
    assert_eq!(state_digest(&forward)?, state_digest(&backward)?);
    Ok(())
}

#[test]
fn late_replica_converges_with_host() -> Result<(), Box<dyn Error>> {
    let mut net = TestNetwork::new()?;
    let mut early = net.add_peer("early")?;
    busy_host(&net)?;
    early.replica.pull()?;

    let late = net.add_peer("late")?;
    let host_digest = net.host_digest()?;
    assert_eq!(early.digest()?, host_digest);
    assert_eq!(late.digest()?, host_digest);

    // The deleted team is gone everywhere; its pairing survives with snapshots.
    let teams = late.replica.lifecycle().teams()?;
    assert_eq!(teams.len(), 1);
    let orphan = late
        .replica
        .lifecycle()
        .pairings()?
        .into_iter()
        .find(|p| p.tid == GlobalId::new(2))
        .ok_or("pairing of deleted team")?;
    assert_eq!(orphan.name_save.as_deref(), Some("102"));
    Ok(())
}

#[test]
fn incremental_pulls_only_carry_new_edits() -> Result<(), Box<dyn Error>> {
    let mut net = TestNetwork::new()?;
    let mut field = net.add_peer("field")?;
    busy_host(&net)?;
    let first = field.replica.pull()?;
    assert!(first.changed() > 0);

    let idle = field.replica.pull()?;
    assert_eq!(idle.changed(), 0);
    assert!(idle.watermark > first.watermark);

    let tid = {
        let mut host = net.host();
        let team = host.lifecycle_mut().create_team("103", "GROUND")?;
        team.tid
    };
    let next = field.replica.pull()?;
    assert_eq!(next.inserted, 1);
    assert_eq!(next.history_added, 1);
    assert!(field.replica.lifecycle().team(tid)?.is_some());
    Ok(())
}

#[test]
fn duplicate_global_ids_fail_the_merge() -> Result<(), Box<dyn Error>> {
    let net = TestNetwork::new()?;
    let team = net.host().lifecycle_mut().create_team("101", "GROUND")?;
    let delta = net.host().pull_since(Epoch::ZERO)?;

    let mut client = EntityLifecycle::client(SqliteStore::open_in_memory()?, "field");
    client.store().insert_team(&team).into_result("seed")?;
    client.store().insert_team(&team).into_result("seed")?;

    let mut sync = SyncEngine::new();
    let result = sync.apply(&mut client, delta);
    assert!(matches!(result, Err(EngineError::ValidationConflict { matched: 2, .. })));
    assert_eq!(sync.watermark(), Epoch::ZERO);
    Ok(())
}

// ============================================================================
// History
// ============================================================================

#[test]
fn history_entries_never_change() -> Result<(), Box<dyn Error>> {
    let mut net = TestNetwork::new()?;
    let mut field = net.add_peer("field")?;
    let team = field.confirmed_team("101", "GROUND")?;
    field.replica.pull()?;
    let before = field.replica.lifecycle().history().for_team(team.tid)?;
    assert_eq!(before.len(), 1);

    field.replica.set_resource(team.tid, "K9 (HRD)")?;
    field.replica.set_status(
        Target::team(team.tid),
        StatusChange::Team(TeamStatus::EnrouteToIc),
        Push::Now,
    )?;
    field.replica.sync_now()?;
    field.replica.pull()?;

    let after = field.replica.lifecycle().history().for_team(team.tid)?;
    assert_eq!(after.len(), 3);
    assert_eq!(after[0], before[0]);
    assert_eq!(after[2].description, "Team 101 status changed to ENROUTE TO IC");
    Ok(())
}

#[test]
fn history_can_be_read_per_pair() -> Result<(), Box<dyn Error>> {
    use tracker_storage::Match;

    let mut net = TestNetwork::new()?;
    let mut field = net.add_peer("field")?;
    let team = field.confirmed_team("101", "GROUND")?;
    let other = field.confirmed_team("102", "GROUND")?;
    let assignment = field.confirmed_assignment("AA", "GROUND")?;
    field.confirmed_pairing(assignment.aid, team.tid)?;
    field
        .replica
        .apply_command(Target::assignment(assignment.aid), StatusCommand::Done, Push::Now)?;
    field.replica.sync_now()?;

    let history = field.replica.lifecycle().history();
    let both = history.for_pair(assignment.aid, team.tid, Match::All)?;
    // paired, closed
    assert_eq!(both.len(), 2);
    let either = history.for_pair(assignment.aid, team.tid, Match::Any)?;
    assert_eq!(either.len(), 6);
    assert!(history.for_team(other.tid)?.len() == 1);
    Ok(())
}
