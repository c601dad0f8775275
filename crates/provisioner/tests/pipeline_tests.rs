//! End-to-end pipeline tests with scripted tools.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use provisioner::config::{NetworkMode, OsKind, Placement, Stage, StageSet};
use provisioner::dispatch::StageOutcome;
use provisioner::ProvisionError;

use common::{
    cancellable_orchestrator, fail, healthy, is_playbook_for, ok, orchestrator, run_config,
    workspace_host, FakeRenderer, FakeRunner, TestEnv,
};
use tokio_util::sync::CancellationToken;

fn addresses(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(h, a)| ((*h).to_string(), (*a).to_string()))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_three_hosts_with_concurrency_two_all_succeed() {
    let env = TestEnv::new();
    let addrs = addresses(&[
        ("web-01", "10.0.0.11"),
        ("web-02", "10.0.0.12"),
        ("web-03", "10.0.0.13"),
    ]);
    let runner = Arc::new(FakeRunner::new(move |cmd| healthy(cmd, &addrs)));
    let renderer = Arc::new(FakeRenderer::default());
    let run = run_config(&[
        ("web-01", Placement::Virtualized, OsKind::Ubuntu),
        ("web-02", Placement::Virtualized, OsKind::Ubuntu),
        ("web-03", Placement::Virtualized, OsKind::Ubuntu),
    ]);
    let config = provisioner::EngineConfig {
        concurrency: 2,
        ..env.engine_config()
    };

    let summary = orchestrator(config, &runner, &renderer)
        .run(&run, &StageSet::all())
        .await;

    assert_eq!(summary.exit_code(), 0);
    let hosts: Vec<&str> = summary.results.iter().map(|r| r.host.as_str()).collect();
    assert_eq!(hosts, ["web-01", "web-02", "web-03"]);
    for result in &summary.results {
        let report = result.outcome.as_ref().unwrap();
        assert_eq!(report.ready, Some(true));
        assert_eq!(report.infra_attempts, Some(1));
        assert_eq!(
            report.stages,
            vec![
                (Stage::Pxe, StageOutcome::Skipped),
                (Stage::Os, StageOutcome::Completed),
                (Stage::Post, StageOutcome::Completed),
            ]
        );
    }
    assert_eq!(
        summary.get("web-02").unwrap().outcome.as_ref().unwrap().address.as_deref(),
        Some("10.0.0.12")
    );
    assert!(renderer.peak() <= 2, "peak concurrency {}", renderer.peak());
    assert_eq!(renderer.rendered().len(), 3);
    assert_eq!(
        runner.count(|c| c.is_subcommand("terraform", "destroy")),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_missing_dhcp_address_fails_only_that_host() {
    let env = TestEnv::new();
    let addrs = addresses(&[
        ("web-01", "10.0.0.11"),
        ("web-02", "dhcp-pending"),
        ("web-03", "10.0.0.13"),
    ]);
    let runner = Arc::new(FakeRunner::new(move |cmd| healthy(cmd, &addrs)));
    let renderer = Arc::new(FakeRenderer::default());
    let run = run_config(&[
        ("web-01", Placement::Virtualized, OsKind::Ubuntu),
        ("web-02", Placement::Virtualized, OsKind::Ubuntu),
        ("web-03", Placement::Virtualized, OsKind::Ubuntu),
    ]);

    let summary = orchestrator(env.engine_config(), &runner, &renderer)
        .run(&run, &StageSet::all())
        .await;

    assert_eq!(summary.exit_code(), 1);
    assert_eq!(summary.failures(), 1);
    assert!(summary.get("web-01").unwrap().is_ok());
    assert!(summary.get("web-03").unwrap().is_ok());
    assert!(matches!(
        summary.get("web-02").unwrap().outcome,
        Err(ProvisionError::AddressResolution { ref host, .. }) if host == "web-02"
    ));

    // No probe and no configuration for the unresolved host.
    for call in runner.calls().iter().filter(|c| c.program() == "ssh") {
        let target = &call.get_args()[call.get_args().len() - 2];
        assert!(!target.contains("dhcp"), "probed {target}");
    }
    assert_eq!(runner.count(|c| is_playbook_for(c, "web-02")), 0);
    assert_eq!(runner.count(|c| is_playbook_for(c, "web-01")), 2);
}

#[tokio::test(start_paused = true)]
async fn test_apply_retries_then_succeeds() {
    let env = TestEnv::new();
    let applies = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&applies);
    let addrs = addresses(&[("web-01", "10.0.0.11")]);
    let runner = Arc::new(FakeRunner::new(move |cmd| {
        if cmd.is_subcommand("terraform", "apply")
            && counter.fetch_add(1, Ordering::SeqCst) < 2
        {
            return fail("Error: timeout while waiting for the QEMU agent");
        }
        healthy(cmd, &addrs)
    }));
    let renderer = Arc::new(FakeRenderer::default());
    let run = run_config(&[("web-01", Placement::Virtualized, OsKind::Ubuntu)]);
    let config = provisioner::EngineConfig {
        infra_max_retries: 3,
        ..env.engine_config()
    };

    let summary = orchestrator(config, &runner, &renderer)
        .run(&run, &StageSet::all())
        .await;

    let result = summary.get("web-01").unwrap();
    let report = result.outcome.as_ref().unwrap();
    assert_eq!(report.infra_attempts, Some(3));
    assert_eq!(applies.load(Ordering::SeqCst), 3);
    assert_eq!(runner.count(|c| c.is_subcommand("terraform", "destroy")), 2);
    assert_eq!(runner.count(|c| c.is_subcommand("terraform", "init")), 1);
    // Render 1s, backoff 15s + 30s, boot grace 30s.
    assert!(result.elapsed >= Duration::from_secs(76));
    assert!(result.elapsed < Duration::from_secs(77));
}

#[tokio::test(start_paused = true)]
async fn test_apply_exhausted_fails_host() {
    let env = TestEnv::new();
    let runner = Arc::new(FakeRunner::new(|cmd| {
        if cmd.is_subcommand("terraform", "apply") {
            fail("Error: 500 Internal Server Error")
        } else {
            ok("")
        }
    }));
    let renderer = Arc::new(FakeRenderer::default());
    let run = run_config(&[("web-01", Placement::Virtualized, OsKind::Ubuntu)]);

    let summary = orchestrator(env.engine_config(), &runner, &renderer)
        .run(&run, &StageSet::all())
        .await;

    assert!(matches!(
        summary.get("web-01").unwrap().outcome,
        Err(ProvisionError::CommandFailed { .. })
    ));
    assert_eq!(runner.count(|c| c.is_subcommand("terraform", "apply")), 2);
    assert_eq!(runner.count(|c| c.is_subcommand("terraform", "destroy")), 1);
    assert_eq!(runner.count(|c| c.program() == "ssh"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_nixos_falls_back_to_ansible_install() {
    let env = TestEnv::new();
    let addrs = addresses(&[("nix-01", "10.0.0.21")]);
    let runner = Arc::new(FakeRunner::new(move |cmd| {
        if cmd.program() == "nix" {
            fail("kexec failed")
        } else {
            healthy(cmd, &addrs)
        }
    }));
    let renderer = Arc::new(FakeRenderer::default());
    let run = run_config(&[("nix-01", Placement::Virtualized, OsKind::Nixos)]);

    let summary = orchestrator(env.engine_config(), &runner, &renderer)
        .run(&run, &StageSet::all())
        .await;

    let report = summary.get("nix-01").unwrap().outcome.as_ref().unwrap();
    assert!(matches!(
        report.stages.iter().find(|(s, _)| *s == Stage::Os),
        Some((_, StageOutcome::CompletedViaFallback { .. }))
    ));
    let nix = runner
        .calls()
        .into_iter()
        .find(|c| c.program() == "nix")
        .unwrap();
    assert!(nix.get_args().contains(&"root@10.0.0.21".to_string()));
    assert!(runner.count(|c| {
        c.program() == "ansible-playbook"
            && c.get_args().iter().any(|a| a.ends_with("nixos_install.yml"))
    }) == 1);

    // NixOS probes stop at liveness; the SSH user is root.
    let ssh: Vec<_> = runner.calls().into_iter().filter(|c| c.program() == "ssh").collect();
    assert_eq!(ssh.len(), 1);
    assert!(ssh[0].get_args().contains(&"root@10.0.0.21".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_missing_install_entry_fails_before_any_tool_runs() {
    let env = TestEnv::new();
    let runner = Arc::new(FakeRunner::new(|cmd| healthy(cmd, &HashMap::new())));
    let renderer = Arc::new(FakeRenderer::default());
    let mut run = run_config(&[
        ("web-01", Placement::Virtualized, OsKind::Ubuntu),
        ("metal-01", Placement::BareMetal, OsKind::Ubuntu),
    ]);
    run.installs.remove("web-01");
    run.installs.get_mut("metal-01").unwrap().network = NetworkMode::Static {
        address_cidr: "10.1.0.5/24".into(),
        gateway: None,
        dns: vec![],
    };

    let summary = orchestrator(env.engine_config(), &runner, &renderer)
        .run(&run, &StageSet::all())
        .await;

    assert!(matches!(
        summary.get("web-01").unwrap().outcome,
        Err(ProvisionError::Configuration(_))
    ));
    assert!(!env.build_root().join("web-01.lock").exists());

    // Bare metal: no infra, no probe, pxe runs.
    let metal = summary.get("metal-01").unwrap().outcome.as_ref().unwrap();
    assert_eq!(metal.infra_attempts, None);
    assert_eq!(metal.ready, None);
    assert_eq!(
        metal.stages.first(),
        Some(&(Stage::Pxe, StageOutcome::Completed))
    );
    assert_eq!(runner.count(|c| c.program() == "terraform"), 0);
    assert_eq!(renderer.rendered(), ["metal-01"]);
}

#[tokio::test(start_paused = true)]
async fn test_plan_only_stops_after_plan() {
    let env = TestEnv::new();
    let runner = Arc::new(FakeRunner::new(|cmd| healthy(cmd, &HashMap::new())));
    let renderer = Arc::new(FakeRenderer::default());
    let run = run_config(&[("web-01", Placement::Virtualized, OsKind::Ubuntu)]);
    let config = provisioner::EngineConfig {
        plan_only: true,
        ..env.engine_config()
    };

    let summary = orchestrator(config, &runner, &renderer)
        .run(&run, &StageSet::all())
        .await;

    let report = summary.get("web-01").unwrap().outcome.as_ref().unwrap();
    assert!(report.planned_only);
    assert!(report.stages.is_empty());
    let subcommands: Vec<String> = runner
        .calls()
        .iter()
        .filter(|c| workspace_host(c).as_deref() == Some("web-01"))
        .map(|c| c.get_args()[0].clone())
        .collect();
    assert_eq!(subcommands, ["init", "validate", "plan"]);
}

#[tokio::test(start_paused = true)]
async fn test_virtualized_host_without_endpoint_is_rejected() {
    let env = TestEnv::new();
    let runner = Arc::new(FakeRunner::new(|cmd| healthy(cmd, &HashMap::new())));
    let renderer = Arc::new(FakeRenderer::default());
    let run = run_config(&[("web-01", Placement::Virtualized, OsKind::Ubuntu)]);

    let summary = orchestrator(env.engine_config(), &runner, &renderer)
        .run_with_endpoint(&run, &StageSet::all(), None)
        .await;

    assert!(matches!(
        summary.get("web-01").unwrap().outcome,
        Err(ProvisionError::Configuration(ref msg)) if msg.contains("infra endpoint")
    ));
    assert!(runner.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_playbooks_target_resolved_dhcp_address() {
    let env = TestEnv::new();
    let addrs = addresses(&[("web-01", "10.0.0.11")]);
    let runner = Arc::new(FakeRunner::new(move |cmd| healthy(cmd, &addrs)));
    let renderer = Arc::new(FakeRenderer::default());
    let run = run_config(&[("web-01", Placement::Virtualized, OsKind::Ubuntu)]);

    let summary = orchestrator(env.engine_config(), &runner, &renderer)
        .run(&run, &StageSet::all())
        .await;

    assert_eq!(summary.exit_code(), 0);
    assert_eq!(renderer.rendered(), ["web-01"]);
    let playbooks: Vec<_> = runner
        .calls()
        .into_iter()
        .filter(|c| is_playbook_for(c, "web-01"))
        .collect();
    assert_eq!(playbooks.len(), 2);
    for call in &playbooks {
        assert!(
            call.get_args().iter().any(|a| a == "ansible_host=10.0.0.11"),
            "{}",
            call.display()
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_boot_grace_stops_queued_hosts() {
    let env = TestEnv::new();
    let addrs = addresses(&[
        ("web-01", "10.0.0.11"),
        ("web-02", "10.0.0.12"),
        ("web-03", "10.0.0.13"),
    ]);
    let runner = Arc::new(FakeRunner::new(move |cmd| healthy(cmd, &addrs)));
    let renderer = Arc::new(FakeRenderer::default());
    let run = run_config(&[
        ("web-01", Placement::Virtualized, OsKind::Ubuntu),
        ("web-02", Placement::Virtualized, OsKind::Ubuntu),
        ("web-03", Placement::Virtualized, OsKind::Ubuntu),
    ]);
    let config = provisioner::EngineConfig {
        concurrency: 1,
        ..env.engine_config()
    };
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        // web-01 is rendered and applied by then, and sits in its 30s grace.
        tokio::time::sleep(Duration::from_secs(10)).await;
        trigger.cancel();
    });

    let summary = cancellable_orchestrator(config, &runner, &renderer, cancel)
        .run(&run, &StageSet::all())
        .await;

    assert_eq!(summary.exit_code(), 1);
    assert_eq!(summary.failures(), 3);
    assert!(matches!(
        summary.get("web-01").unwrap().outcome,
        Err(ProvisionError::Cancelled { ref command }) if command == "boot grace period"
    ));
    for host in ["web-02", "web-03"] {
        assert!(matches!(
            summary.get(host).unwrap().outcome,
            Err(ProvisionError::Cancelled { ref command }) if *command == format!("provision {host}")
        ));
    }
    assert_eq!(renderer.rendered(), ["web-01"]);
    assert_eq!(runner.count(|c| c.program() == "ssh"), 0);
    assert_eq!(runner.count(|c| c.program() == "ansible-playbook"), 0);
}
