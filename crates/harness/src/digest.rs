use tracker_core::{AssignmentRow, HistoryRow, PairingRow, TeamRow};
use tracker_engine::{EngineError, EntityLifecycle};

/// Hash of a node's replicated state. Local row keys are left out, so a
/// replica that has converged with the host produces the same digest.
pub fn state_digest(lifecycle: &EntityLifecycle) -> Result<blake3::Hash, EngineError> {
    let mut teams = lifecycle.teams()?;
    teams.sort_by_key(|row| row.tid);
    let mut assignments = lifecycle.assignments()?;
    assignments.sort_by_key(|row| row.aid);
    let mut pairings = lifecycle.pairings()?;
    pairings.sort_by_key(|row| row.pid);
    let mut history = lifecycle.history().all()?;
    history.sort_by_key(|row| row.hid);

    let mut canonical = String::new();
    for row in &teams {
        team_line(&mut canonical, row);
    }
    for row in &assignments {
        assignment_line(&mut canonical, row);
    }
    for row in &pairings {
        pairing_line(&mut canonical, row);
    }
    for row in &history {
        history_line(&mut canonical, row);
    }
    Ok(blake3::hash(canonical.as_bytes()))
}

fn team_line(out: &mut String, row: &TeamRow) {
    out.push_str(&format!(
        "team|{}|{}|{}|{}|{}|{}\n",
        row.tid, row.name, row.status, row.resource, row.medical, row.last_edit_epoch
    ));
}

fn assignment_line(out: &mut String, row: &AssignmentRow) {
    out.push_str(&format!(
        "assignment|{}|{}|{}|{}|{:?}|{}\n",
        row.aid, row.name, row.status, row.intended_resource, row.external_ref, row.last_edit_epoch
    ));
}

fn pairing_line(out: &mut String, row: &PairingRow) {
    out.push_str(&format!(
        "pairing|{}|{}|{}|{}|{:?}|{:?}|{}\n",
        row.pid, row.aid, row.tid, row.status, row.name_save, row.resource_save, row.last_edit_epoch
    ));
}

fn history_line(out: &mut String, row: &HistoryRow) {
    out.push_str(&format!(
        "history|{}|{:?}|{:?}|{}|{}|{}\n",
        row.hid, row.aid, row.tid, row.description, row.recorded_by, row.epoch
    ));
}
