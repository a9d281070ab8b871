use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracker_core::{
    GlobalId, RowKey,
    wire::{Envelope, HostRequest, HostResponse},
};
use tracker_engine::{HostLink, LinkError, PullScheduler, Replica, SessionState};
use tracker_harness::{LoopbackLink, TestNetwork, TestPeer};

const HOUR: Duration = Duration::from_secs(3_600);

async fn wait_for(
    replica: &Arc<Mutex<Replica>>,
    limit: Duration,
    done: impl Fn(&Replica) -> bool,
) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        {
            let replica = replica.lock().unwrap();
            if done(&replica) {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn wait_until(replica: &Arc<Mutex<Replica>>, done: impl Fn(&Replica) -> bool) -> bool {
    wait_for(replica, Duration::from_secs(3), done).await
}

fn has_team(replica: &Replica, tid: GlobalId) -> bool {
    matches!(replica.lifecycle().team(tid), Ok(Some(_)))
}

#[tokio::test]
async fn change_signal_triggers_a_pull() -> Result<(), Box<dyn Error>> {
    let mut net = TestNetwork::new()?;
    let replica = Arc::new(Mutex::new(net.add_peer("field")?.into_replica()));
    let scheduler = PullScheduler::spawn(replica.clone(), HOUR, Some(net.subscribe()));

    // The first interval tick fires immediately.
    for _ in 0..300 {
        if scheduler.pulls() >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(scheduler.pulls() >= 1);

    let tid = net.host().lifecycle_mut().create_team("101", "GROUND")?.tid;
    assert!(wait_until(&replica, |r| has_team(r, tid)).await);

    scheduler.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn interval_alone_is_enough() -> Result<(), Box<dyn Error>> {
    let mut net = TestNetwork::new()?;
    let replica = Arc::new(Mutex::new(net.add_peer("field")?.into_replica()));
    // No notification subscription at all: every signal is lost.
    let scheduler = PullScheduler::spawn(replica.clone(), Duration::from_millis(20), None);

    let tid = net.host().lifecycle_mut().create_team("101", "GROUND")?.tid;
    assert!(wait_until(&replica, |r| has_team(r, tid)).await);

    scheduler.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn request_pull_runs_outside_the_interval() -> Result<(), Box<dyn Error>> {
    let mut net = TestNetwork::new()?;
    let replica = Arc::new(Mutex::new(net.add_peer("field")?.into_replica()));
    let scheduler = PullScheduler::spawn(replica.clone(), HOUR, None);

    let tid = net.host().lifecycle_mut().create_team("101", "GROUND")?.tid;
    scheduler.request_pull();
    assert!(wait_until(&replica, |r| has_team(r, tid)).await);

    scheduler.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn terminated_session_stops_the_loop() -> Result<(), Box<dyn Error>> {
    let mut net = TestNetwork::new()?;
    let mut peer = net.add_peer("field")?;
    net.set_online(false);
    assert!(peer.replica.liveness_check().is_err());
    assert_eq!(peer.replica.state(), SessionState::Terminated);
    net.set_online(true);

    let replica = Arc::new(Mutex::new(peer.into_replica()));
    let scheduler = PullScheduler::spawn(replica, Duration::from_millis(20), None);
    for _ in 0..300 {
        if scheduler.is_finished() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(scheduler.is_finished());
    assert_eq!(scheduler.pulls(), 0);
    scheduler.shutdown().await;
    Ok(())
}

/// Holds every mutation for `delay` before passing it on.
struct SlowLink {
    inner: Arc<LoopbackLink>,
    delay: Duration,
}

impl HostLink for SlowLink {
    fn call(&self, envelope: Envelope) -> Result<HostResponse, LinkError> {
        if !matches!(envelope.request, HostRequest::PullSince { .. }) {
            std::thread::sleep(self.delay);
        }
        self.inner.call(envelope)
    }

    fn probe(&self, timeout: Duration) -> Result<(), LinkError> {
        self.inner.probe(timeout)
    }

    fn describe(&self) -> String {
        format!("slow {}", self.inner.describe())
    }
}

fn team_confirmed(replica: &Replica, n: RowKey) -> bool {
    matches!(replica.lifecycle().team_at(n), Ok(Some(team)) if team.tid.is_confirmed())
}

#[tokio::test]
async fn mutations_do_not_wait_for_a_slow_host() -> Result<(), Box<dyn Error>> {
    let mut net = TestNetwork::new()?;
    let slow: Arc<dyn HostLink> = Arc::new(SlowLink {
        inner: net.link(),
        delay: Duration::from_millis(750),
    });
    let replica = Arc::new(Mutex::new(TestPeer::connect("field", vec![slow])?.into_replica()));
    let scheduler = PullScheduler::spawn(replica.clone(), HOUR, None);

    let started = Instant::now();
    let first = replica.lock().unwrap().create_team("101", "GROUND")?;
    let second = replica.lock().unwrap().create_team("102", "GROUND")?;
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(first.tid.is_tentative());
    assert!(second.tid.is_tentative());

    // Delivered in the background, one slow call each.
    assert!(
        wait_for(&replica, Duration::from_secs(10), |r| {
            team_confirmed(r, first.n) && team_confirmed(r, second.n)
        })
        .await
    );
    assert!(replica.lock().unwrap().outbox().is_empty());
    assert_eq!(net.host().lifecycle().teams()?.len(), 2);

    scheduler.shutdown().await;
    Ok(())
}
