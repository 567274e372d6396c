//! End-to-end reconciliation tests for elastic balancers and the security
//! groups protecting their backends.

mod common;

use common::{LB_NAME, TestCloud, annotate, elastic_service, instance};
use lbsync::annotations::{self, NetworkInterfaceKeys};
use lbsync::model::{NETWORK_COMMON_GLOBAL, PROTOCOL_ICMP, PROTOCOL_TCP};
use lbsync::{
    ApiError, Call, ElasticApi, ElasticLoadBalancer, Error, ErrorCode, HealthCheck,
    NetworkInterface, PortPair, Reconciler, SecurityGroupRule,
};
use tokio_test::{assert_err, assert_ok};

const VIP: &str = "203.0.113.1";

fn tcp_from(port: u16, source: &str) -> SecurityGroupRule {
    SecurityGroupRule::inbound(PROTOCOL_TCP, Some(port), source)
}

fn icmp_from(source: &str) -> SecurityGroupRule {
    SecurityGroupRule::inbound(PROTOCOL_ICMP, None, source)
}

#[tokio::test]
async fn test_create_two_ports_authorizes_backends() {
    let t = TestCloud::new();
    t.cloud.add_security_group("sg-1", &["worker1", "worker2"]).await;
    let svc = elastic_service(&[(80, 30000), (443, 30443)]);

    let status = assert_ok!(
        t.provider
            .ensure_load_balancer(&svc, &[instance("worker1"), instance("worker2")])
            .await
    );
    assert_eq!(status.vip, VIP);

    assert_eq!(t.count("CreateElasticLoadBalancer").await, 1);
    assert_eq!(t.count("RegisterPortWithElasticLoadBalancer").await, 1);
    assert_eq!(t.count("ConfigureElasticHealthCheck").await, 2);
    assert_eq!(t.count("RegisterInstancesWithElasticLoadBalancer").await, 2);
    // One derived rule per port, one group
    assert_eq!(t.count("AuthorizeSecurityGroupIngress").await, 2);
    assert_eq!(t.count("WaitSecurityGroupApplied").await, 2);
    assert_eq!(t.count("SetFilterForElasticLoadBalancer").await, 0);

    let rules = t.cloud.security_group_rules("sg-1").await;
    assert_eq!(rules.len(), 2);
    assert!(rules.contains(&tcp_from(30000, VIP)));
    assert!(rules.contains(&tcp_from(30443, VIP)));

    let snapshot = t.cloud.snapshot().await;
    assert_eq!(snapshot.elastic_load_balancers.len(), 2);
    assert!(snapshot.load_balancers.is_empty());
}

#[tokio::test]
async fn test_second_reconcile_is_noop() {
    let t = TestCloud::new();
    t.cloud.add_security_group("sg-1", &["worker1"]).await;
    let svc = elastic_service(&[(80, 30000), (443, 30443)]);

    assert_ok!(t.provider.ensure_load_balancer(&svc, &[instance("worker1")]).await);
    t.cloud.clear_calls().await;

    assert_ok!(t.provider.ensure_load_balancer(&svc, &[instance("worker1")]).await);
    assert!(t.cloud.mutating_calls().await.is_empty());
}

#[tokio::test]
async fn test_duplicate_rule_is_not_an_error() {
    let t = TestCloud::new();
    t.cloud.add_security_group("sg-1", &["worker1"]).await;
    let mut svc = elastic_service(&[(80, 30000), (443, 30443)]);
    annotate(&mut svc, annotations::LB_HEALTHCHECK_PROTOCOL, "ICMP");

    assert_ok!(t.provider.ensure_load_balancer(&svc, &[instance("worker1")]).await);

    // The ICMP rule derived for the second port already exists
    assert_eq!(t.count("AuthorizeSecurityGroupIngress").await, 4);
    let rules = t.cloud.security_group_rules("sg-1").await;
    assert_eq!(rules.len(), 3);
    assert!(rules.contains(&icmp_from(VIP)));
}

#[tokio::test]
async fn test_two_interfaces_admit_private_side() {
    let t = TestCloud::new();
    t.cloud.add_security_group("sg-1", &["worker1"]).await;
    let mut svc = elastic_service(&[(80, 30000)]);
    let public = NetworkInterfaceKeys::slot(1);
    let private = NetworkInterfaceKeys::slot(2);
    annotate(&mut svc, &public.network_id, NETWORK_COMMON_GLOBAL);
    annotate(&mut svc, &public.vip_network, "true");
    annotate(&mut svc, &private.network_id, "net-private1");
    annotate(&mut svc, &private.ip_address, "10.0.0.1");
    annotate(&mut svc, &private.system_ip_addresses, "10.0.0.2,10.0.0.3");
    annotate(&mut svc, &private.vip_network, "false");

    assert_ok!(t.provider.ensure_load_balancer(&svc, &[instance("worker1")]).await);

    let rules = t.cloud.security_group_rules("sg-1").await;
    assert_eq!(
        rules,
        vec![
            tcp_from(30000, "10.0.0.1"),
            tcp_from(30000, "10.0.0.2"),
            tcp_from(30000, "10.0.0.3"),
        ]
    );
}

#[tokio::test]
async fn test_removed_backend_revokes_its_group() {
    let t = TestCloud::new();
    t.cloud.add_security_group("sg-1", &["worker1"]).await;
    t.cloud.add_security_group("sg-2", &["worker2"]).await;
    let svc = elastic_service(&[(80, 30000)]);

    assert_ok!(
        t.provider
            .ensure_load_balancer(&svc, &[instance("worker1"), instance("worker2")])
            .await
    );
    assert_eq!(t.cloud.security_group_rules("sg-2").await.len(), 1);
    t.cloud.clear_calls().await;

    assert_ok!(t.provider.update_load_balancer(&svc, &[instance("worker1")]).await);
    assert_eq!(
        t.mutating_operations().await,
        vec![
            "DeregisterInstancesFromElasticLoadBalancer",
            "RevokeSecurityGroupIngress",
        ]
    );
    assert!(t.cloud.security_group_rules("sg-2").await.is_empty());
    assert_eq!(
        t.cloud.security_group_rules("sg-1").await,
        vec![tcp_from(30000, VIP)]
    );
}

#[tokio::test]
async fn test_shared_group_keeps_rules_for_remaining_backend() {
    let t = TestCloud::new();
    t.cloud.add_security_group("sg-1", &["worker1", "worker2"]).await;
    let svc = elastic_service(&[(80, 30000)]);

    assert_ok!(
        t.provider
            .ensure_load_balancer(&svc, &[instance("worker1"), instance("worker2")])
            .await
    );
    t.cloud.clear_calls().await;

    assert_ok!(t.provider.ensure_load_balancer(&svc, &[instance("worker1")]).await);
    assert_eq!(t.count("DeregisterInstancesFromElasticLoadBalancer").await, 1);
    assert_eq!(t.count("RevokeSecurityGroupIngress").await, 0);
    assert_eq!(t.cloud.security_group_rules("sg-1").await.len(), 1);
}

#[tokio::test]
async fn test_removed_port_keeps_rules_shared_with_remaining_port() {
    let t = TestCloud::new();
    t.cloud.add_security_group("sg-1", &["worker1"]).await;
    let mut svc = elastic_service(&[(80, 30000), (443, 30443)]);
    annotate(&mut svc, annotations::LB_HEALTHCHECK_PROTOCOL, "ICMP");
    assert_ok!(t.provider.ensure_load_balancer(&svc, &[instance("worker1")]).await);
    t.cloud.clear_calls().await;

    let mut svc = elastic_service(&[(80, 30000)]);
    annotate(&mut svc, annotations::LB_HEALTHCHECK_PROTOCOL, "ICMP");
    assert_ok!(t.provider.update_load_balancer(&svc, &[instance("worker1")]).await);
    assert_eq!(
        t.mutating_operations().await,
        vec![
            "DeregisterInstancesFromElasticLoadBalancer",
            "RevokeSecurityGroupIngress",
            "DeleteElasticLoadBalancer",
        ]
    );
    let revoked: Vec<_> = t
        .calls_of("RevokeSecurityGroupIngress")
        .await
        .into_iter()
        .map(|c| match c {
            Call::RevokeSecurityGroupIngress { rule, .. } => rule,
            other => panic!("unexpected call: {other:?}"),
        })
        .collect();
    assert_eq!(revoked, vec![tcp_from(30443, VIP)]);
    assert_eq!(
        t.cloud.security_group_rules("sg-1").await,
        vec![tcp_from(30000, VIP), icmp_from(VIP)]
    );

    t.cloud.clear_calls().await;
    assert_ok!(t.provider.ensure_load_balancer(&svc, &[instance("worker1")]).await);
    assert!(t.cloud.mutating_calls().await.is_empty());
}

#[tokio::test]
async fn test_removed_backend_keeps_rules_of_other_ports_on_its_group() {
    let t = TestCloud::new();
    t.cloud.add_security_group("sg-1", &["worker1"]).await;
    t.cloud.add_security_group("sg-2", &["worker2"]).await;
    let mut svc = elastic_service(&[(80, 30000), (443, 30443)]);
    annotate(&mut svc, annotations::LB_HEALTHCHECK_PROTOCOL, "ICMP");
    assert_ok!(
        t.provider
            .ensure_load_balancer(&svc, &[instance("worker1"), instance("worker2")])
            .await
    );
    assert_eq!(t.cloud.security_group_rules("sg-2").await.len(), 3);

    assert_ok!(t.provider.update_load_balancer(&svc, &[instance("worker1")]).await);
    assert!(t.cloud.security_group_rules("sg-2").await.is_empty());
    assert_eq!(
        t.cloud.security_group_rules("sg-1").await,
        vec![tcp_from(30000, VIP), icmp_from(VIP), tcp_from(30443, VIP)]
    );
}

#[tokio::test]
async fn test_missing_ingress_on_revoke_is_not_an_error() {
    let t = TestCloud::new();
    t.cloud.add_security_group("sg-1", &["worker1"]).await;
    t.cloud.add_security_group("sg-2", &["worker2"]).await;
    let svc = elastic_service(&[(80, 30000)]);
    assert_ok!(
        t.provider
            .ensure_load_balancer(&svc, &[instance("worker1"), instance("worker2")])
            .await
    );

    // Someone removed the rule out of band
    assert_ok!(
        t.cloud
            .revoke_security_group_ingress("sg-2", &tcp_from(30000, VIP))
            .await
    );

    assert_ok!(t.provider.ensure_load_balancer(&svc, &[instance("worker1")]).await);
    let snapshot = t.cloud.snapshot().await;
    assert_eq!(snapshot.elastic_load_balancers[0].instances.len(), 1);
}

#[tokio::test]
async fn test_health_check_change_swaps_rules() {
    let t = TestCloud::new();
    t.cloud.add_security_group("sg-1", &["worker1"]).await;
    let mut svc = elastic_service(&[(80, 30000)]);
    assert_ok!(t.provider.ensure_load_balancer(&svc, &[instance("worker1")]).await);
    t.cloud.clear_calls().await;

    annotate(&mut svc, annotations::LB_HEALTHCHECK_PROTOCOL, "ICMP");
    assert_ok!(t.provider.ensure_load_balancer(&svc, &[instance("worker1")]).await);
    assert_eq!(
        t.mutating_operations().await,
        vec!["ConfigureElasticHealthCheck", "AuthorizeSecurityGroupIngress"]
    );
    assert_eq!(
        t.cloud.security_group_rules("sg-1").await,
        vec![tcp_from(30000, VIP), icmp_from(VIP)]
    );

    t.cloud.clear_calls().await;
    annotate(&mut svc, annotations::LB_HEALTHCHECK_PROTOCOL, "TCP");
    assert_ok!(t.provider.ensure_load_balancer(&svc, &[instance("worker1")]).await);
    assert_eq!(
        t.mutating_operations().await,
        vec!["ConfigureElasticHealthCheck", "RevokeSecurityGroupIngress"]
    );
    assert_eq!(
        t.cloud.security_group_rules("sg-1").await,
        vec![tcp_from(30000, VIP)]
    );
}

#[tokio::test]
async fn test_side_effect_failure_is_wrapped_and_retry_converges() {
    let t = TestCloud::new();
    t.cloud.add_security_group("sg-1", &["worker1"]).await;
    t.cloud
        .fail_on(
            "ConfigureElasticHealthCheck",
            ApiError::new(ErrorCode::Other("Server.Unavailable".into()), "try later"),
        )
        .await;
    let svc = elastic_service(&[(80, 30000)]);

    let err = assert_err!(t.provider.ensure_load_balancer(&svc, &[instance("worker1")]).await);
    match &err {
        Error::SideEffect { target, source } => {
            assert_eq!(target.ports, Some(PortPair::new(80, 30000)));
            assert!(matches!(
                source.as_ref(),
                Error::Remote {
                    op: "ConfigureElasticHealthCheck",
                    ..
                }
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.is_api(&ErrorCode::Other("Server.Unavailable".into())));

    assert_ok!(t.provider.ensure_load_balancer(&svc, &[instance("worker1")]).await);
    assert_eq!(
        t.cloud.security_group_rules("sg-1").await,
        vec![tcp_from(30000, VIP)]
    );

    t.cloud.clear_calls().await;
    assert_ok!(t.provider.ensure_load_balancer(&svc, &[instance("worker1")]).await);
    assert!(t.cloud.mutating_calls().await.is_empty());
}

#[tokio::test]
async fn test_interface_count_violation_is_fatal() {
    let t = TestCloud::new();
    t.cloud.add_security_group("sg-1", &["worker1"]).await;
    let lb = ElasticLoadBalancer {
        name: LB_NAME.to_string(),
        protocol: PROTOCOL_TCP.to_string(),
        load_balancer_port: 80,
        instance_port: 30000,
        health_check: HealthCheck {
            target: "TCP:30000".to_string(),
            ..Default::default()
        },
        instances: vec![instance("worker1")],
        network_interfaces: Vec::<NetworkInterface>::new(),
        ..Default::default()
    };

    let err = assert_err!(t.elastic().reconcile(LB_NAME, &[lb]).await);
    match err {
        Error::SideEffect { source, .. } => {
            assert!(matches!(
                *source,
                Error::NetworkInterfaceCount { count: 0, .. }
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(t.count("AuthorizeSecurityGroupIngress").await, 0);
}

#[tokio::test]
async fn test_delete_revokes_then_deletes() {
    let t = TestCloud::new();
    t.cloud.add_security_group("sg-1", &["worker1"]).await;
    let svc = elastic_service(&[(80, 30000), (443, 30443)]);
    assert_ok!(t.provider.ensure_load_balancer(&svc, &[instance("worker1")]).await);
    t.cloud.clear_calls().await;

    assert_ok!(t.provider.ensure_load_balancer_deleted(&svc).await);
    assert_eq!(
        t.mutating_operations().await,
        vec![
            "DeregisterInstancesFromElasticLoadBalancer",
            "RevokeSecurityGroupIngress",
            "DeleteElasticLoadBalancer",
            "DeregisterInstancesFromElasticLoadBalancer",
            "RevokeSecurityGroupIngress",
            "DeleteElasticLoadBalancer",
        ]
    );
    assert!(t.cloud.security_group_rules("sg-1").await.is_empty());
    assert_eq!(assert_ok!(t.provider.get_load_balancer(&svc).await), None);
}

#[tokio::test]
async fn test_delete_tolerates_vanished_instances() {
    let t = TestCloud::new();
    t.cloud.add_security_group("sg-1", &["worker1"]).await;
    let svc = elastic_service(&[(80, 30000)]);
    assert_ok!(t.provider.ensure_load_balancer(&svc, &[instance("worker1")]).await);

    t.cloud
        .fail_on(
            "DeregisterInstancesFromElasticLoadBalancer",
            ApiError::new(ErrorCode::InstanceNotFound, "worker1 is gone"),
        )
        .await;
    t.cloud
        .fail_on(
            "DescribeSecurityGroupsByInstanceIds",
            ApiError::new(ErrorCode::InstanceNotFound, "worker1 is gone"),
        )
        .await;

    assert_ok!(t.provider.ensure_load_balancer_deleted(&svc).await);
    assert!(t.cloud.snapshot().await.elastic_load_balancers.is_empty());
}

#[tokio::test]
async fn test_status_of_missing_balancer() {
    let t = TestCloud::new();
    assert_eq!(assert_ok!(t.elastic().status(LB_NAME).await), None);
    assert_ok!(t.elastic().delete(LB_NAME).await);
    assert!(t.cloud.mutating_calls().await.is_empty());
}
