mod common;

use common::{entry, gateway_cidr, Harness, BRIDGE, GATEWAY_MAC};
use ipsec_gateway::store::MANAGED_REGION_MARKER;
use ipsec_gateway::{GatewayFile, GatewayStore, ManagerError, SequenceError, StoreError};

fn creation_commands(h: &Harness) -> Vec<String> {
    vec![
        "ip link add veth_ovs type veth peer name veth_ipsec".to_string(),
        "ovs-vsctl add-port br-int veth_ovs".to_string(),
        "ip link set veth_ovs up".to_string(),
        "ip link set veth_ipsec up".to_string(),
        format!("echo 1 > {}", h.forward_sysctl()),
        "ip addr add 10.1.0.254/24 dev veth_ipsec".to_string(),
        "strongswan start".to_string(),
    ]
}

#[tokio::test]
async fn create_runs_sequence_and_records_gateway() {
    let h = Harness::new();
    let descriptor = h.manager.create_gateway(BRIDGE, gateway_cidr()).await.unwrap();

    let mut expected = vec!["ip link show veth_ipsec".to_string()];
    expected.extend(creation_commands(&h));
    expected.push("cat /sys/class/net/veth_ipsec/address".to_string());
    assert_eq!(h.exec.commands(), expected);

    assert_eq!(descriptor.gateway_mac.as_str(), GATEWAY_MAC);
    assert_eq!(descriptor.ovs_bridge, BRIDGE);

    let stored = GatewayFile::new(
        &h.config.paths.gateway_descriptor,
        ipsec_gateway::store::Templates::embedded().gateway,
    )
    .load()
    .unwrap();
    assert_eq!(stored, Some(descriptor));

    let conf = h.conf();
    assert!(conf.starts_with(common::CONF_PREAMBLE));
    assert_eq!(conf.matches(MANAGED_REGION_MARKER).count(), 1);
}

#[tokio::test]
async fn second_create_is_refused_without_external_calls() {
    let h = Harness::with_gateway().await;
    let err = h.manager.create_gateway(BRIDGE, gateway_cidr()).await.unwrap_err();
    assert!(matches!(err, ManagerError::GatewayExists));
    assert_eq!(err.to_string(), "A gateway already exists");
    assert!(h.exec.commands().is_empty());
}

#[tokio::test]
async fn existing_interface_blocks_create() {
    let h = Harness::new();
    h.exec.reply("ip link show", 0, "5: veth_ipsec@veth_ovs: <BROADCAST>", "");

    let err = h.manager.create_gateway(BRIDGE, gateway_cidr()).await.unwrap_err();
    assert!(matches!(err, ManagerError::GatewayExists));
    assert_eq!(h.exec.commands(), vec!["ip link show veth_ipsec"]);
    assert!(!h.has_descriptor());
}

#[tokio::test]
async fn bridge_with_shell_metacharacters_is_refused() {
    let h = Harness::new();
    let err = h
        .manager
        .create_gateway("br-int;reboot", gateway_cidr())
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::Store(StoreError::InvalidEntry(_))));
    assert!(h.exec.commands().is_empty());
    assert!(!h.has_descriptor());
}

#[tokio::test]
async fn unexpected_link_show_failure_is_reported() {
    let h = Harness::new();
    h.exec.fail("ip link show", "Cannot open netlink socket: Permission denied");

    let err = h.manager.create_gateway(BRIDGE, gateway_cidr()).await.unwrap_err();
    assert!(matches!(err, ManagerError::Command(_)));
    assert_eq!(h.exec.commands().len(), 1);
}

#[tokio::test]
async fn failure_at_each_step_unwinds_completed_steps_in_reverse() {
    // Undo commands of the two reversible steps, keyed by their index.
    let undo_of = |index: usize| match index {
        0 => Some("ip link delete veth_ovs"),
        1 => Some("ovs-vsctl del-port br-int veth_ovs"),
        6 => Some("strongswan stop"),
        _ => None,
    };

    for failing in 0..7 {
        let h = Harness::new();
        let steps = creation_commands(&h);
        h.exec.fail(&steps[failing], "boom\nsecond line");

        let err = h.manager.create_gateway(BRIDGE, gateway_cidr()).await.unwrap_err();
        match &err {
            ManagerError::Sequence(SequenceError::StepFailed {
                command,
                undo_failures,
                ..
            }) => {
                assert_eq!(command, &steps[failing]);
                assert!(undo_failures.is_empty());
            }
            other => panic!("step {failing}: unexpected error {other:?}"),
        }
        assert_eq!(
            err.to_string(),
            format!("Failed to execute '{}':\n    boom\n    second line", steps[failing])
        );

        let mut expected = vec!["ip link show veth_ipsec".to_string()];
        expected.extend(steps[..=failing].iter().cloned());
        expected.extend(
            (0..failing)
                .rev()
                .filter_map(undo_of)
                .map(str::to_string),
        );
        assert_eq!(h.exec.commands(), expected, "failing step {failing}");
        assert!(!h.has_descriptor());
    }
}

#[tokio::test]
async fn failed_undo_is_reported_with_the_step_failure() {
    let h = Harness::new();
    h.exec.fail("strongswan start", "charon refused to start");
    h.exec.fail("ip link delete", "Cannot find device \"veth_ovs\"");

    let err = h.manager.create_gateway(BRIDGE, gateway_cidr()).await.unwrap_err();
    let ManagerError::Sequence(SequenceError::StepFailed { undo_failures, .. }) = &err else {
        panic!("unexpected error {err:?}");
    };
    assert_eq!(undo_failures.len(), 1);
    assert!(undo_failures[0].contains("ip link delete veth_ovs"));
    assert!(err.to_string().contains("Rollback incomplete"));
}

#[tokio::test]
async fn unreadable_mac_rolls_back_the_whole_sequence() {
    let h = Harness::new();
    h.exec.reply("cat /sys/class/net/", 0, "not-a-mac", "");

    let err = h.manager.create_gateway(BRIDGE, gateway_cidr()).await.unwrap_err();
    assert!(matches!(err, ManagerError::Parse(_)));

    let commands = h.exec.commands();
    let tail: Vec<&str> = commands[commands.len() - 3..].iter().map(String::as_str).collect();
    assert_eq!(
        tail,
        vec![
            "strongswan stop",
            "ovs-vsctl del-port br-int veth_ovs",
            "ip link delete veth_ovs",
        ]
    );
    assert!(!h.has_descriptor());
}

#[tokio::test]
async fn destroy_removes_tunnels_then_gateway() {
    let h = Harness::with_gateway().await;
    h.manager
        .add_tunnel(&entry("t1", "10.0.0.1", "10.0.0.2"))
        .await
        .unwrap();
    h.manager
        .add_tunnel(&entry("t2", "10.0.0.5", "10.0.0.6"))
        .await
        .unwrap();
    h.exec.clear();

    h.manager.destroy_gateway().await.unwrap();

    let commands = h.exec.commands();
    let down_t1 = commands.iter().position(|c| c == "strongswan down t1").unwrap();
    let down_t2 = commands.iter().position(|c| c == "strongswan down t2").unwrap();
    assert!(down_t1 < down_t2);
    assert_eq!(
        commands[commands.len() - 3..].to_vec(),
        vec![
            "ovs-vsctl del-port br-int veth_ovs",
            "ip link delete veth_ovs",
            "strongswan stop",
        ]
    );

    assert!(!h.has_descriptor());
    assert!(h.manager.list_tunnels().unwrap().is_empty());
    assert!(!h.secrets().contains("# t1"));
}

#[tokio::test]
async fn destroy_without_gateway_is_refused() {
    let h = Harness::new();
    let err = h.manager.destroy_gateway().await.unwrap_err();
    assert!(matches!(err, ManagerError::NoGateway));
    assert_eq!(err.to_string(), "There is no local gateway");
    assert!(h.exec.commands().is_empty());
}

#[tokio::test]
async fn gateway_can_be_recreated_after_destroy() {
    let h = Harness::with_gateway().await;
    h.manager.destroy_gateway().await.unwrap();
    h.manager.create_gateway("br-ex", gateway_cidr()).await.unwrap();
    assert!(h.has_descriptor());
    assert_eq!(h.conf().matches(MANAGED_REGION_MARKER).count(), 1);
}
