/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

#![cfg(target_family = "unix")]

mod common;

use common::FakeServer;
use netsim_runner::{
    config::Config,
    error::{kind_of, OrchestratorError},
    network::{ConditionSchedule, NetworkCondition, NetworkImpairmentController, ScheduleEntry, StreamConfig},
    process_control::ProcessSupervisor,
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

fn controller(fake: &FakeServer, dir: &std::path::Path) -> anyhow::Result<(NetworkImpairmentController, Arc<ProcessSupervisor>)> {
    controller_from(&fake.server_toml(), dir)
}

fn controller_from(
    server_toml: &str,
    dir: &std::path::Path,
) -> anyhow::Result<(NetworkImpairmentController, Arc<ProcessSupervisor>)> {
    let config = Config::try_from_str(server_toml)?;
    let supervisor = Arc::new(ProcessSupervisor::new());
    let controller = NetworkImpairmentController::new(config.server, dir.to_path_buf(), supervisor.clone());
    Ok((controller, supervisor))
}

#[tokio::test]
async fn started_server_reports_urls_and_metrics() -> anyhow::Result<()> {
    let fake = FakeServer::spawn().await?;
    let dir = tempfile::tempdir()?;
    common::touch(dir.path(), "front.mp4")?;
    common::touch(dir.path(), "rear.mp4")?;
    let (controller, supervisor) = controller(&fake, dir.path())?;

    let streams = [
        StreamConfig::new("front.mp4", "front"),
        StreamConfig::new("rear.mp4", "/rear").with_condition(NetworkCondition::profile("3g")),
    ];
    let info = controller
        .start_server("main", &streams, Some(fake.data_port), Some(fake.control_port))
        .await?;

    assert_eq!(
        info.urls,
        [
            format!("rtsp://127.0.0.1:{}/front", fake.data_port),
            format!("rtsp://127.0.0.1:{}/rear", fake.data_port),
        ]
    );
    assert_eq!(controller.get_urls("main")?, info.urls);
    assert!(controller.is_running("main"));
    assert!(supervisor.is_tracked("server/main"));

    tokio::time::sleep(Duration::from_millis(500)).await;
    let metrics = controller.get_metrics("main").expect("metrics snapshot");
    assert_eq!(metrics.clients, 2);
    assert_eq!(metrics.bytes_sent, 4096);

    assert!(controller.stop_server("main").await?);
    assert!(!controller.is_running("main"));
    assert!(supervisor.is_empty());
    Ok(())
}

#[tokio::test]
async fn updates_reach_the_control_route_with_profiles_expanded() -> anyhow::Result<()> {
    let fake = FakeServer::spawn().await?;
    let dir = tempfile::tempdir()?;
    common::touch(dir.path(), "cam.mp4")?;
    let (controller, _supervisor) = controller(&fake, dir.path())?;

    controller
        .start_server("cam", &[StreamConfig::new("cam.mp4", "cam")], Some(fake.data_port), Some(fake.control_port))
        .await?;

    controller
        .update_condition("cam", 0, &NetworkCondition::profile("poor"))
        .await?;
    assert!(controller.update_condition("cam", 3, &NetworkCondition::profile("poor")).await.is_err());

    let updates = fake.updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0]["stream_index"], 0);
    assert_eq!(updates[0]["packet_loss"], 10.0);
    assert_eq!(updates[0]["latency_ms"], 500);
    assert_eq!(
        controller.current_condition("cam", 0),
        Some(NetworkCondition::profile("poor"))
    );

    assert_eq!(controller.cleanup_all().await, 1);
    assert_eq!(controller.cleanup_all().await, 0);
    Ok(())
}

#[tokio::test]
async fn schedules_apply_in_order_and_stop_at_the_duration() -> anyhow::Result<()> {
    let fake = FakeServer::spawn().await?;
    let dir = tempfile::tempdir()?;
    common::touch(dir.path(), "cam.mp4")?;
    let (controller, _supervisor) = controller(&fake, dir.path())?;

    controller
        .start_server("cam", &[StreamConfig::new("cam.mp4", "cam")], Some(fake.data_port), Some(fake.control_port))
        .await?;

    let loss = |v: f64| NetworkCondition {
        packet_loss: Some(v),
        ..Default::default()
    };
    let schedule = ConditionSchedule::new([
        ScheduleEntry::new(Duration::from_millis(200), loss(20.0)),
        ScheduleEntry::new(Duration::ZERO, loss(1.0)),
        ScheduleEntry::new(Duration::from_secs(30), loss(99.0)),
    ]);

    let applied = controller
        .run_schedule("cam", 0, &schedule, Duration::from_millis(500), &CancellationToken::new())
        .await?;
    assert_eq!(applied, 2);

    let losses: Vec<f64> = fake
        .updates()
        .iter()
        .filter_map(|u| u["packet_loss"].as_f64())
        .collect();
    assert_eq!(losses, [1.0, 20.0]);
    assert_eq!(controller.current_condition("cam", 0), Some(loss(20.0)));

    controller.cleanup_all().await;
    Ok(())
}

#[tokio::test]
async fn restarting_a_name_replaces_the_old_server() -> anyhow::Result<()> {
    let fake = FakeServer::spawn().await?;
    let dir = tempfile::tempdir()?;
    common::touch(dir.path(), "cam.mp4")?;
    let (controller, supervisor) = controller(&fake, dir.path())?;
    let streams = [StreamConfig::new("cam.mp4", "cam")];

    let first = controller
        .start_server("cam", &streams, Some(fake.data_port), Some(fake.control_port))
        .await?;
    let first_pid = controller.server_handle("cam").and_then(|h| h.pid);
    let second = controller
        .start_server("cam", &streams, Some(fake.data_port), Some(fake.control_port))
        .await?;

    assert_eq!(first.data_port, second.data_port);
    assert_ne!(controller.server_handle("cam").and_then(|h| h.pid), first_pid);
    assert_eq!(controller.list_servers().len(), 1);
    assert_eq!(supervisor.len(), 1);

    controller.cleanup_all().await;
    Ok(())
}

#[tokio::test]
async fn closed_data_port_times_out_and_frees_everything() -> anyhow::Result<()> {
    let fake = FakeServer::spawn_without_data_port().await?;
    let dir = tempfile::tempdir()?;
    common::touch(dir.path(), "cam.mp4")?;
    let (controller, supervisor) = controller_from(&common::server_toml_running("sleep 60", 1.0), dir.path())?;
    let streams = [StreamConfig::new("cam.mp4", "cam")];

    for _ in 0..2 {
        // the second round would hit a port conflict if the first had kept its ports
        let err = controller
            .start_server("cam", &streams, Some(fake.data_port), Some(fake.control_port))
            .await
            .unwrap_err();
        assert!(
            matches!(kind_of(&err), Some(OrchestratorError::ReadinessTimeout { .. })),
            "unexpected error: {err:#}"
        );
        assert!(!controller.is_running("cam"));
        assert!(!supervisor.is_tracked("server/cam"));
    }
    Ok(())
}

#[tokio::test]
async fn server_exiting_before_ready_is_a_crash() -> anyhow::Result<()> {
    let fake = FakeServer::spawn_without_data_port().await?;
    let dir = tempfile::tempdir()?;
    common::touch(dir.path(), "cam.mp4")?;
    let (controller, supervisor) = controller_from(&common::server_toml_running("exit 3", 10.0), dir.path())?;

    let err = controller
        .start_server("cam", &[StreamConfig::new("cam.mp4", "cam")], Some(fake.data_port), Some(fake.control_port))
        .await
        .unwrap_err();
    match kind_of(&err) {
        Some(OrchestratorError::ProcessCrash { code, .. }) => assert_eq!(*code, Some(3)),
        other => panic!("expected a crash, got {other:?}"),
    }
    assert!(!controller.is_running("cam"));
    assert!(supervisor.is_empty());
    Ok(())
}

#[tokio::test]
async fn failing_metrics_route_keeps_the_last_snapshot() -> anyhow::Result<()> {
    let fake = FakeServer::spawn().await?;
    let dir = tempfile::tempdir()?;
    common::touch(dir.path(), "cam.mp4")?;
    let (controller, _supervisor) = controller(&fake, dir.path())?;

    controller
        .start_server("cam", &[StreamConfig::new("cam.mp4", "cam")], Some(fake.data_port), Some(fake.control_port))
        .await?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(controller.get_metrics("cam").map(|m| m.clients), Some(2));

    fake.break_metrics();
    tokio::time::sleep(Duration::from_millis(500)).await;
    let metrics = controller.get_metrics("cam").expect("snapshot kept");
    assert_eq!(metrics.clients, 2);
    assert_eq!(metrics.bytes_sent, 4096);
    assert!(controller.is_running("cam"));

    controller.cleanup_all().await;
    Ok(())
}
