//! Integration tests for opening and closing blade connections through
//! `VirtualBlades`.

#[path = "common/blade_fixture.rs"]
mod blade_fixture;

use std::time::Duration;

use blade_fixture::BladeFixture;
use bladelink::test_support::{
    ProcessScript, ScriptedBroker, ScriptedLauncher, SignalEvent, TunnelBehaviour,
    sample_provider_json,
};
use bladelink::{BladeError, CommandOptions, ConnectPolicy, Connection, ConnectionState};
use rstest::rstest;

const SECRETS: [&str; 2] = ["compute-ssh-key", "host-ssh-key"];

#[tokio::test(start_paused = true)]
async fn connect_blades_opens_instances_type_by_type() {
    let fixture = BladeFixture::new(&sample_provider_json(), &SECRETS);

    let set = fixture
        .blades
        .connect_blades(8080, None)
        .await
        .expect("all tunnels should open");

    let launches = fixture.broker.launches();
    let opened: Vec<&str> = launches
        .iter()
        .map(|launch| launch.request.hostname.as_str())
        .collect();
    assert_eq!(
        opened,
        [
            "compute-001",
            "compute-002",
            "compute-003",
            "host-blade-001",
            "host-blade-002"
        ]
    );
    assert!(launches.iter().all(|launch| launch.request.remote_port == 8080));
    assert_eq!(set.len(), 5);
    assert_eq!(set.list_connections(Some("host-blade")).len(), 2);
    let second = set
        .get_connection("compute-002")
        .expect("compute-002 should be in the set");
    assert_eq!(second.instance(), 1);
    assert_eq!(second.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn connect_blades_restricted_to_one_type() {
    let fixture = BladeFixture::new(&sample_provider_json(), &SECRETS);
    let selection = [String::from("host-blade")];

    let set = fixture
        .blades
        .connect_blades(22, Some(&selection))
        .await
        .expect("host-blade tunnels should open");

    assert_eq!(set.len(), 2);
    assert!(set.iter().all(|connection| connection.blade_type() == "host-blade"));
}

#[tokio::test(start_paused = true)]
async fn dropping_a_set_kills_every_tunnel() {
    let fixture = BladeFixture::new(&sample_provider_json(), &SECRETS);

    let set = fixture
        .blades
        .connect_blades(22, None)
        .await
        .expect("all tunnels should open");
    drop(set);

    for launch in fixture.broker.launches() {
        assert_eq!(launch.signal_events(), [SignalEvent::Killed]);
    }
}

#[tokio::test(start_paused = true)]
async fn failed_member_tears_down_opened_tunnels() {
    let broker = ScriptedBroker::default();
    broker.push(TunnelBehaviour::Listen);
    broker.push(TunnelBehaviour::ExitEarly(1));
    let fixture = BladeFixture::with_doubles(
        &sample_provider_json(),
        &SECRETS,
        broker,
        ScriptedLauncher::default(),
    );
    let blades = fixture.blades.with_policy(ConnectPolicy {
        reconnects: 1,
        ..ConnectPolicy::default()
    });

    let err = blades
        .connect_blades(22, None)
        .await
        .expect_err("second blade should fail to connect");

    assert!(matches!(err, BladeError::ConnectionTimeout { .. }), "got {err:?}");
    let launches = fixture.broker.launches();
    assert_eq!(launches.len(), 2);
    let first = launches.first().expect("first launch recorded");
    assert_eq!(first.request.hostname, "compute-001");
    assert_eq!(first.signal_events(), [SignalEvent::Killed]);
}

#[rstest]
#[case::missing_keys(&[])]
#[case::other_type_only(&["host-ssh-key"])]
#[tokio::test(start_paused = true)]
async fn ssh_connect_requires_readable_keys(#[case] secrets: &[&str]) {
    let fixture = BladeFixture::new(&sample_provider_json(), secrets);

    let err = fixture
        .blades
        .ssh_connect_blade("compute", 0, None)
        .await
        .expect_err("missing keys should be rejected");

    assert!(matches!(err, BladeError::Configuration { .. }), "got {err:?}");
    assert!(fixture.broker.launches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn ssh_command_runs_through_the_tunnel() {
    let launcher = ScriptedLauncher::new(ProcessScript::exits(0, Duration::from_secs(2)));
    let fixture = BladeFixture::with_doubles(
        &sample_provider_json(),
        &SECRETS,
        ScriptedBroker::default(),
        launcher,
    );

    let connection = fixture
        .blades
        .ssh_connect_blade("host-blade", 1, None)
        .await
        .expect("ssh connection should open");
    let port = connection
        .local_port()
        .expect("connected tunnels have a local port");
    connection
        .run_command("hostname -f {blade_hostname}", &CommandOptions::default())
        .await
        .expect("command should succeed");

    let tunnel = fixture.broker.launches();
    let request = &tunnel.first().expect("tunnel launched").request;
    assert_eq!(request.hostname, "host-blade-002");
    assert_eq!(request.remote_port, 22);

    let launches = fixture.launcher.launches();
    let ssh = launches.first().expect("ssh launched");
    let key = fixture
        .build_dir
        .join("blade_ssh_keys/host-ssh-key/id_rsa");
    assert!(
        ssh.command_string()
            .starts_with(&format!("ssh -i {key} ")),
        "unexpected command: {}",
        ssh.command_string()
    );
    assert!(
        ssh.command_string()
            .ends_with(&format!("-o Port={port} root@127.0.0.1 hostname -f host-blade-002")),
        "unexpected command: {}",
        ssh.command_string()
    );
    assert!(ssh.logs.out.as_str().contains("run-hostname-host-blade-002"));
}

#[test]
fn accessors_delegate_to_the_catalog() {
    let fixture = BladeFixture::new(&sample_provider_json(), &SECRETS);
    let blades = &fixture.blades;

    assert_eq!(blades.blade_types(), ["compute", "host-blade"]);
    assert_eq!(blades.blade_count("compute").ok(), Some(3));
    assert_eq!(
        blades.blade_interconnects("compute").ok(),
        Some(vec![String::from("cluster-net")])
    );
    assert_eq!(
        blades.blade_ip("compute", 2, "cluster-net").ok().as_deref(),
        Some("10.1.0.12")
    );
    assert_eq!(blades.interconnects().interconnect_names(), ["cluster-net"]);
    assert_eq!(
        blades.interconnects().ipv4_cidr("cluster-net").ok().as_deref(),
        Some("10.1.0.0/16")
    );
    let (public, private) = blades
        .blade_ssh_key_paths("compute")
        .expect("keys were written");
    assert!(public.as_str().ends_with("compute-ssh-key/id_rsa.pub"));
    assert!(private.as_str().ends_with("compute-ssh-key/id_rsa"));
}
