//! Convergence properties of the comparator

use htc_haproxy::parse;
use htc_sync::{compare, OpKind};

const DESIRED: &str = "global
  maxconn 4000

defaults
  mode http
  timeout client 30s

frontend www
  bind *:80
  acl is_api path_beg /api
  use_backend api if is_api
  default_backend web

backend api
  balance roundrobin
  server srv1 10.1.0.1:8080 check
  server srv2 10.1.0.2:8080 check

backend web
  server web1 10.2.0.1:8080 check
";

#[test]
fn live_state_equal_to_desired_yields_an_empty_plan() {
    // Observational equality after a successful reconcile: re-entry
    // produces no operations and therefore no reload.
    let desired = parse(DESIRED).unwrap();
    let live = parse(DESIRED).unwrap();
    let plan = compare(&desired, &live);
    assert!(plan.is_empty());
    assert_eq!(plan.summary().total, 0);
}

#[test]
fn a_drifted_server_is_corrected_with_one_update() {
    let desired = parse(DESIRED).unwrap();
    let drifted = parse(&DESIRED.replace("server srv2 10.1.0.2:8080 check", "server srv2 10.1.0.9:8080 check")).unwrap();

    let plan = compare(&desired, &drifted);
    assert_eq!(plan.summary().total, 1);
    assert_eq!(plan.ops[0].kind, OpKind::Update);
    assert_eq!(plan.ops[0].path, "backends/api/servers/srv2");

    // Applying the desired state (simulated by re-parsing it) converges.
    let converged = parse(DESIRED).unwrap();
    assert!(compare(&desired, &converged).is_empty());
}

#[test]
fn plan_respects_referential_integrity_end_to_end() {
    let desired = parse(DESIRED).unwrap();
    let empty = htc_haproxy::Config::default();
    let plan = compare(&desired, &empty);

    let position = |predicate: fn(&htc_sync::Operation) -> bool| {
        plan.ops.iter().position(predicate).expect("operation present")
    };
    let backend = position(|op| op.path == "backends" && op.kind == OpKind::Create);
    let server = position(|op| op.path.starts_with("backends/") && op.path.contains("/servers"));
    let frontend = position(|op| op.path == "frontends" && op.kind == OpKind::Create);
    let rule = position(|op| op.path.contains("backend_switching_rules"));

    assert!(backend < server, "backend before its servers");
    assert!(backend < rule, "backend before the rule referencing it");
    assert!(frontend < rule, "frontend before its rules");
}

#[test]
fn structural_equivalence_survives_a_rewrite_cycle() {
    // parse -> (simulated) apply -> re-parse: the comparator sees the two
    // structures as equivalent even with reordered sections.
    let desired = parse(DESIRED).unwrap();
    let reordered = parse(
        "global
  maxconn 4000

defaults
  mode http
  timeout client 30s

backend web
  server web1 10.2.0.1:8080 check

backend api
  balance roundrobin
  server srv1 10.1.0.1:8080 check
  server srv2 10.1.0.2:8080 check

frontend www
  bind *:80
  acl is_api path_beg /api
  use_backend api if is_api
  default_backend web
",
    )
    .unwrap();
    assert!(compare(&desired, &reordered).is_empty());
}
