//! Structural stability of the parser

use htc_haproxy::parse;

const CONFIG: &str = "global
  daemon
  maxconn 2000
  log 127.0.0.1:514 local0

defaults
  mode http
  timeout client 30s
  timeout server 30s
  timeout connect 5s

frontend www
  bind *:80
  bind *:443 ssl crt /etc/haproxy/ssl/site.pem
  acl is_api path_beg /api
  http-request set-header X-Forwarded-Proto https if { ssl_fc }
  use_backend api if is_api
  default_backend web

backend api
  balance roundrobin
  server srv1 10.1.0.1:8080 check weight 10
  server srv2 10.1.0.2:8080 check backup

backend web
  server web1 10.2.0.1:8080 check
";

#[test]
fn parsing_is_deterministic() {
    let a = parse(CONFIG).unwrap();
    let b = parse(CONFIG).unwrap();
    assert_eq!(a, b);
}

#[test]
fn whitespace_and_comments_do_not_change_structure() {
    let noisy = CONFIG
        .lines()
        .map(|line| format!("  {line}   "))
        .collect::<Vec<_>>()
        .join("\n")
        + "\n# trailing comment\n";
    assert_eq!(parse(CONFIG).unwrap(), parse(&noisy).unwrap());
}

#[test]
fn serialization_round_trips_through_json() {
    // The model is the wire format for live-state reads; deserializing
    // what we serialize must reproduce the structure.
    let config = parse(CONFIG).unwrap();
    let json = serde_json::to_value(&config).unwrap();
    let back: htc_haproxy::Config = serde_json::from_value(json).unwrap();
    assert_eq!(config, back);
}
