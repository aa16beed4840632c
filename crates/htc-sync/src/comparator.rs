//! Live-vs-desired comparison
//!
//! Produces the minimal ordered operation plan that converges live state to
//! the desired parsed configuration. Named collections (frontends,
//! backends, servers, binds, ...) compare by name; rules, ACLs and other
//! sequences compare index-wise because position is semantic. Anything the
//! structured model cannot express flips `requires_raw`.

use htc_haproxy::model::*;
use htc_haproxy::to_api_model;
use serde::Serialize;
use tracing::error;

use crate::plan::{rank, OpKind, Operation, Plan};

trait Named {
    fn element_name(&self) -> &str;
}

macro_rules! named {
    ($($ty:ty => $field:ident),* $(,)?) => {
        $(impl Named for $ty {
            fn element_name(&self) -> &str {
                &self.$field
            }
        })*
    };
}

named! {
    Frontend => name,
    Backend => name,
    Server => name,
    Bind => name,
    Nameserver => name,
    PeerEntry => name,
    MailerEntry => name,
    Group => name,
    User => username,
    ServerTemplate => prefix,
}

/// Compare desired against live configuration.
pub fn compare(desired: &Config, live: &Config) -> Plan {
    let mut plan = Plan::default();
    plan.requires_raw = desired.has_unstructured_directives() || aux_has_extras(desired);

    // Singletons.
    singleton(&mut plan, "global", &sans(&desired.global, |g| g.extras.clear()), &sans(&live.global, |g| g.extras.clear()));
    singleton(&mut plan, "defaults", &sans(&desired.defaults, |d| d.extras.clear()), &sans(&live.defaults, |d| d.extras.clear()));

    compare_backends(&mut plan, desired, live);
    compare_frontends(&mut plan, desired, live);
    compare_aux(&mut plan, desired, live);

    plan.finish();
    plan
}

fn aux_has_extras(config: &Config) -> bool {
    config.resolvers.iter().any(|s| !s.extras.is_empty())
        || config.peers.iter().any(|s| !s.extras.is_empty())
        || config.caches.iter().any(|s| !s.extras.is_empty())
        || config.mailers.iter().any(|s| !s.extras.is_empty())
        || config.rings.iter().any(|s| !s.extras.is_empty())
        || config.programs.iter().any(|s| !s.extras.is_empty())
        || config.fcgi_apps.iter().any(|s| !s.extras.is_empty())
        || config.crt_stores.iter().any(|s| !s.extras.is_empty())
        || config.log_forwards.iter().any(|s| !s.extras.is_empty())
}

fn sans<T: Clone>(value: &T, clear: impl FnOnce(&mut T)) -> T {
    let mut copy = value.clone();
    clear(&mut copy);
    copy
}

fn singleton<T: PartialEq + Serialize>(plan: &mut Plan, path: &str, desired: &T, live: &T) {
    if desired != live {
        push(plan, OpKind::Update, path.to_string(), Some(desired), rank::SINGLETON, path);
    }
}

fn frontend_shell(frontend: &Frontend) -> Frontend {
    sans(frontend, |f| {
        f.binds.clear();
        f.acls.clear();
        f.http_request_rules.clear();
        f.http_response_rules.clear();
        f.tcp_request_rules.clear();
        f.backend_switching_rules.clear();
        f.captures.clear();
        f.filters.clear();
        f.log_targets.clear();
        f.extras.clear();
    })
}

fn backend_shell(backend: &Backend) -> Backend {
    sans(backend, |b| {
        b.servers.clear();
        b.server_templates.clear();
        b.acls.clear();
        b.http_request_rules.clear();
        b.http_response_rules.clear();
        b.http_checks.clear();
        b.filters.clear();
        b.log_targets.clear();
        b.extras.clear();
    })
}

fn compare_frontends(plan: &mut Plan, desired: &Config, live: &Config) {
    for gone in missing_names(&live.frontends, &desired.frontends) {
        push::<()>(
            plan,
            OpKind::Delete,
            format!("frontends/{gone}"),
            None,
            rank::FRONTEND_DELETE,
            &format!("frontend {gone}"),
        );
    }
    for frontend in &desired.frontends {
        match find(&live.frontends, &frontend.name) {
            None => {
                push(
                    plan,
                    OpKind::Create,
                    "frontends".to_string(),
                    Some(&frontend_shell(frontend)),
                    rank::FRONTEND_UPSERT,
                    &format!("frontend {}", frontend.name),
                );
                frontend_children(plan, frontend, &Frontend::default());
            }
            Some(live_frontend) => {
                if frontend_shell(frontend) != frontend_shell(live_frontend) {
                    push(
                        plan,
                        OpKind::Update,
                        format!("frontends/{}", frontend.name),
                        Some(&frontend_shell(frontend)),
                        rank::FRONTEND_UPSERT,
                        &format!("frontend {}", frontend.name),
                    );
                }
                frontend_children(plan, frontend, live_frontend);
            }
        }
    }
}

fn frontend_children(plan: &mut Plan, desired: &Frontend, live: &Frontend) {
    let base = format!("frontends/{}", desired.name);
    diff_named(
        plan,
        &desired.binds,
        &live.binds,
        &format!("{base}/binds"),
        rank::FRONTEND_CHILD_UPSERT,
        rank::FRONTEND_CHILD_DELETE,
        "bind",
    );
    diff_ordered(plan, &desired.acls, &live.acls, &format!("{base}/acls"), rank::FRONTEND_CHILD_UPSERT, rank::FRONTEND_CHILD_DELETE, "acl");
    diff_ordered(
        plan,
        &desired.http_request_rules,
        &live.http_request_rules,
        &format!("{base}/http_request_rules"),
        rank::FRONTEND_CHILD_UPSERT,
        rank::FRONTEND_CHILD_DELETE,
        "http-request rule",
    );
    diff_ordered(
        plan,
        &desired.http_response_rules,
        &live.http_response_rules,
        &format!("{base}/http_response_rules"),
        rank::FRONTEND_CHILD_UPSERT,
        rank::FRONTEND_CHILD_DELETE,
        "http-response rule",
    );
    diff_ordered(
        plan,
        &desired.tcp_request_rules,
        &live.tcp_request_rules,
        &format!("{base}/tcp_request_rules"),
        rank::FRONTEND_CHILD_UPSERT,
        rank::FRONTEND_CHILD_DELETE,
        "tcp-request rule",
    );
    diff_ordered(
        plan,
        &desired.backend_switching_rules,
        &live.backend_switching_rules,
        &format!("{base}/backend_switching_rules"),
        rank::FRONTEND_CHILD_UPSERT,
        rank::FRONTEND_CHILD_DELETE,
        "use_backend rule",
    );
    diff_ordered(plan, &desired.captures, &live.captures, &format!("{base}/captures"), rank::FRONTEND_CHILD_UPSERT, rank::FRONTEND_CHILD_DELETE, "capture");
    diff_ordered(plan, &desired.filters, &live.filters, &format!("{base}/filters"), rank::FRONTEND_CHILD_UPSERT, rank::FRONTEND_CHILD_DELETE, "filter");
    diff_ordered(plan, &desired.log_targets, &live.log_targets, &format!("{base}/log_targets"), rank::FRONTEND_CHILD_UPSERT, rank::FRONTEND_CHILD_DELETE, "log target");
}

fn compare_backends(plan: &mut Plan, desired: &Config, live: &Config) {
    for gone in missing_names(&live.backends, &desired.backends) {
        push::<()>(
            plan,
            OpKind::Delete,
            format!("backends/{gone}"),
            None,
            rank::BACKEND_DELETE,
            &format!("backend {gone}"),
        );
    }
    for backend in &desired.backends {
        match find(&live.backends, &backend.name) {
            None => {
                push(
                    plan,
                    OpKind::Create,
                    "backends".to_string(),
                    Some(&backend_shell(backend)),
                    rank::BACKEND_UPSERT,
                    &format!("backend {}", backend.name),
                );
                backend_children(plan, backend, &Backend::default());
            }
            Some(live_backend) => {
                if backend_shell(backend) != backend_shell(live_backend) {
                    push(
                        plan,
                        OpKind::Update,
                        format!("backends/{}", backend.name),
                        Some(&backend_shell(backend)),
                        rank::BACKEND_UPSERT,
                        &format!("backend {}", backend.name),
                    );
                }
                backend_children(plan, backend, live_backend);
            }
        }
    }
}

fn backend_children(plan: &mut Plan, desired: &Backend, live: &Backend) {
    let base = format!("backends/{}", desired.name);
    diff_named(
        plan,
        &desired.servers,
        &live.servers,
        &format!("{base}/servers"),
        rank::BACKEND_CHILD,
        rank::BACKEND_CHILD,
        "server",
    );
    diff_named(
        plan,
        &desired.server_templates,
        &live.server_templates,
        &format!("{base}/server_templates"),
        rank::BACKEND_CHILD,
        rank::BACKEND_CHILD,
        "server-template",
    );
    diff_ordered(plan, &desired.acls, &live.acls, &format!("{base}/acls"), rank::BACKEND_CHILD, rank::BACKEND_CHILD, "acl");
    diff_ordered(
        plan,
        &desired.http_request_rules,
        &live.http_request_rules,
        &format!("{base}/http_request_rules"),
        rank::BACKEND_CHILD,
        rank::BACKEND_CHILD,
        "http-request rule",
    );
    diff_ordered(
        plan,
        &desired.http_response_rules,
        &live.http_response_rules,
        &format!("{base}/http_response_rules"),
        rank::BACKEND_CHILD,
        rank::BACKEND_CHILD,
        "http-response rule",
    );
    diff_ordered(plan, &desired.http_checks, &live.http_checks, &format!("{base}/http_checks"), rank::BACKEND_CHILD, rank::BACKEND_CHILD, "http-check");
    diff_ordered(plan, &desired.filters, &live.filters, &format!("{base}/filters"), rank::BACKEND_CHILD, rank::BACKEND_CHILD, "filter");
    diff_ordered(plan, &desired.log_targets, &live.log_targets, &format!("{base}/log_targets"), rank::BACKEND_CHILD, rank::BACKEND_CHILD, "log target");
}

fn compare_aux(plan: &mut Plan, desired: &Config, live: &Config) {
    // Sections with managed child collections.
    aux_named(plan, &desired.resolvers, &live.resolvers, "resolvers", |plan, section, live_section| {
        diff_named(
            plan,
            &section.nameservers,
            &live_section.nameservers,
            &format!("resolvers/{}/nameservers", section.name),
            rank::AUX_UPSERT,
            rank::AUX_UPSERT,
            "nameserver",
        );
    });
    aux_named(plan, &desired.peers, &live.peers, "peers", |plan, section, live_section| {
        diff_named(
            plan,
            &section.peer_entries,
            &live_section.peer_entries,
            &format!("peers/{}/peer_entries", section.name),
            rank::AUX_UPSERT,
            rank::AUX_UPSERT,
            "peer",
        );
    });
    aux_named(plan, &desired.mailers, &live.mailers, "mailers", |plan, section, live_section| {
        diff_named(
            plan,
            &section.mailer_entries,
            &live_section.mailer_entries,
            &format!("mailers/{}/mailer_entries", section.name),
            rank::AUX_UPSERT,
            rank::AUX_UPSERT,
            "mailer",
        );
    });

    // Whole-body sections.
    whole_aux(plan, &desired.caches, &live.caches, "caches");
    whole_aux(plan, &desired.userlists, &live.userlists, "userlists");
    whole_aux(plan, &desired.rings, &live.rings, "rings");
    whole_aux(plan, &desired.programs, &live.programs, "programs");
    whole_aux(plan, &desired.fcgi_apps, &live.fcgi_apps, "fcgi_apps");
    whole_aux(plan, &desired.crt_stores, &live.crt_stores, "crt_stores");
    whole_aux(plan, &desired.http_errors_sections, &live.http_errors_sections, "http_errors_sections");
    whole_aux(plan, &desired.log_forwards, &live.log_forwards, "log_forwards");
}

trait SectionName {
    fn section_name(&self) -> &str;
}

macro_rules! section_name {
    ($($ty:ty),* $(,)?) => {
        $(impl SectionName for $ty {
            fn section_name(&self) -> &str {
                &self.name
            }
        })*
    };
}

section_name!(Resolvers, Peers, Mailers, Cache, Userlist, Ring, Program, FcgiApp, CrtStore, HttpErrorsSection, LogForward);

fn aux_named<T, F>(plan: &mut Plan, desired: &[T], live: &[T], collection: &str, mut children: F)
where
    T: SectionName + Clone + PartialEq + Serialize + Default,
    F: FnMut(&mut Plan, &T, &T),
{
    for gone in live
        .iter()
        .filter(|l| !desired.iter().any(|d| d.section_name() == l.section_name()))
    {
        push::<()>(
            plan,
            OpKind::Delete,
            format!("{collection}/{}", gone.section_name()),
            None,
            rank::AUX_DELETE,
            &format!("{collection} {}", gone.section_name()),
        );
    }
    for section in desired {
        match live.iter().find(|l| l.section_name() == section.section_name()) {
            None => {
                push(
                    plan,
                    OpKind::Create,
                    collection.to_string(),
                    Some(section),
                    rank::AUX_UPSERT,
                    &format!("{collection} {}", section.section_name()),
                );
                children(plan, section, &T::default());
            }
            Some(live_section) => {
                children(plan, section, live_section);
            }
        }
    }
}

fn whole_aux<T: SectionName + PartialEq + Serialize>(
    plan: &mut Plan,
    desired: &[T],
    live: &[T],
    collection: &str,
) {
    for gone in live
        .iter()
        .filter(|l| !desired.iter().any(|d| d.section_name() == l.section_name()))
    {
        push::<()>(
            plan,
            OpKind::Delete,
            format!("{collection}/{}", gone.section_name()),
            None,
            rank::AUX_DELETE,
            &format!("{collection} {}", gone.section_name()),
        );
    }
    for section in desired {
        match live.iter().find(|l| l.section_name() == section.section_name()) {
            None => push(
                plan,
                OpKind::Create,
                collection.to_string(),
                Some(section),
                rank::AUX_UPSERT,
                &format!("{collection} {}", section.section_name()),
            ),
            Some(live_section) if live_section != section => push(
                plan,
                OpKind::Update,
                format!("{collection}/{}", section.section_name()),
                Some(section),
                rank::AUX_UPSERT,
                &format!("{collection} {}", section.section_name()),
            ),
            Some(_) => {}
        }
    }
}

fn find<'a, T: Named>(haystack: &'a [T], name: &str) -> Option<&'a T> {
    haystack.iter().find(|t| t.element_name() == name)
}

fn missing_names<T: Named>(live: &[T], desired: &[T]) -> Vec<String> {
    live.iter()
        .filter(|l| !desired.iter().any(|d| d.element_name() == l.element_name()))
        .map(|l| l.element_name().to_string())
        .collect()
}

/// Diff a name-addressed child collection.
fn diff_named<T: Named + PartialEq + Serialize>(
    plan: &mut Plan,
    desired: &[T],
    live: &[T],
    collection: &str,
    upsert_rank: u8,
    delete_rank: u8,
    label: &str,
) {
    for gone in missing_names(live, desired) {
        push::<()>(
            plan,
            OpKind::Delete,
            format!("{collection}/{gone}"),
            None,
            delete_rank,
            &format!("{label} {gone}"),
        );
    }
    for element in desired {
        match find(live, element.element_name()) {
            None => push(
                plan,
                OpKind::Create,
                collection.to_string(),
                Some(element),
                upsert_rank,
                &format!("{label} {}", element.element_name()),
            ),
            Some(live_element) if live_element != element => push(
                plan,
                OpKind::Update,
                format!("{collection}/{}", element.element_name()),
                Some(element),
                upsert_rank,
                &format!("{label} {}", element.element_name()),
            ),
            Some(_) => {}
        }
    }
}

/// Diff an index-addressed ordered sequence. Updates and creates are
/// emitted in index order; surplus live entries are deleted from the
/// highest index down so remaining indices stay valid.
fn diff_ordered<T: PartialEq + Serialize>(
    plan: &mut Plan,
    desired: &[T],
    live: &[T],
    collection: &str,
    upsert_rank: u8,
    delete_rank: u8,
    label: &str,
) {
    for (index, element) in desired.iter().enumerate() {
        match live.get(index) {
            Some(live_element) if live_element == element => {}
            Some(_) => push(
                plan,
                OpKind::Update,
                format!("{collection}/{index}"),
                Some(element),
                upsert_rank,
                &format!("{label} {index}"),
            ),
            None => push(
                plan,
                OpKind::Create,
                format!("{collection}/{index}"),
                Some(element),
                upsert_rank,
                &format!("{label} {index}"),
            ),
        }
    }
    for index in (desired.len()..live.len()).rev() {
        push::<()>(
            plan,
            OpKind::Delete,
            format!("{collection}/{index}"),
            None,
            delete_rank,
            &format!("{label} {index}"),
        );
    }
}

fn push<T: Serialize>(
    plan: &mut Plan,
    kind: OpKind,
    path: String,
    body: Option<&T>,
    rank: u8,
    describe: &str,
) {
    let body = match body {
        Some(model) => match to_api_model(model) {
            Some(value) => Some(value),
            None => {
                error!(element = describe, "model transform returned nil, forcing raw fallback");
                plan.requires_raw = true;
                return;
            }
        },
        None => None,
    };
    plan.ops.push(Operation { kind, path, body, rank, describe: describe.to_string() });
}

#[cfg(test)]
mod tests {
    use super::*;
    use htc_haproxy::parse;

    const DESIRED: &str = "global\n  maxconn 2000\nfrontend www\n  bind *:80\n  acl is_api path_beg /api\n  use_backend api if is_api\n  default_backend web\nbackend api\n  server srv1 10.0.0.1:8080 check\nbackend web\n  server web1 10.0.1.1:8080 check\n";

    #[test]
    fn equal_configs_produce_empty_plan() {
        let desired = parse(DESIRED).unwrap();
        let live = parse(DESIRED).unwrap();
        let plan = compare(&desired, &live);
        assert!(plan.is_empty(), "plan was {:?}", plan.ops);
    }

    #[test]
    fn fresh_pod_creates_backends_before_frontend_rules() {
        let desired = parse(DESIRED).unwrap();
        let live = Config::default();
        let plan = compare(&desired, &live);
        assert!(!plan.requires_raw);

        let backend_create = plan
            .ops
            .iter()
            .position(|op| op.path == "backends" && op.kind == OpKind::Create)
            .expect("backend create present");
        let switching_rule = plan
            .ops
            .iter()
            .position(|op| op.path.contains("backend_switching_rules"))
            .expect("switching rule create present");
        assert!(backend_create < switching_rule);
    }

    #[test]
    fn removed_backend_is_deleted_after_rule_referencing_it() {
        let desired = parse(
            "global\n  maxconn 2000\nfrontend www\n  bind *:80\n  default_backend web\nbackend web\n  server web1 10.0.1.1:8080 check\n",
        )
        .unwrap();
        let live = parse(DESIRED).unwrap();
        let plan = compare(&desired, &live);

        let rule_delete = plan
            .ops
            .iter()
            .position(|op| op.path.contains("backend_switching_rules") && op.kind == OpKind::Delete)
            .expect("rule delete present");
        let backend_delete = plan
            .ops
            .iter()
            .position(|op| op.path == "backends/api" && op.kind == OpKind::Delete)
            .expect("backend delete present");
        assert!(rule_delete < backend_delete);
        // The frontend update (dropping the acl) must not delete the kept frontend.
        assert!(!plan.ops.iter().any(|op| op.path == "frontends/www" && op.kind == OpKind::Delete));
    }

    #[test]
    fn changed_singleton_yields_one_update() {
        let desired = parse("global\n  maxconn 4000\n").unwrap();
        let live = parse("global\n  maxconn 2000\n").unwrap();
        let plan = compare(&desired, &live);
        assert_eq!(plan.ops.len(), 1);
        assert_eq!(plan.ops[0].path, "global");
        assert_eq!(plan.ops[0].kind, OpKind::Update);
        assert_eq!(plan.ops[0].body.as_ref().unwrap()["maxconn"], 4000);
    }

    #[test]
    fn server_change_updates_in_place() {
        let desired = parse("backend api\n  server srv1 10.0.0.1:8080 check weight 20\n").unwrap();
        let live = parse("backend api\n  server srv1 10.0.0.1:8080 check weight 10\n").unwrap();
        let plan = compare(&desired, &live);
        assert_eq!(plan.ops.len(), 1);
        assert_eq!(plan.ops[0].path, "backends/api/servers/srv1");
        assert_eq!(plan.ops[0].kind, OpKind::Update);
    }

    #[test]
    fn rule_sequences_diff_index_wise_with_reverse_deletes() {
        let desired = parse("frontend f\n  http-request allow if a\n").unwrap();
        let live = parse(
            "frontend f\n  http-request allow if a\n  http-request deny if b\n  http-request deny if c\n",
        )
        .unwrap();
        let plan = compare(&desired, &live);
        let deletes: Vec<_> = plan
            .ops
            .iter()
            .filter(|op| op.kind == OpKind::Delete)
            .map(|op| op.path.clone())
            .collect();
        assert_eq!(
            deletes,
            vec![
                "frontends/f/http_request_rules/2",
                "frontends/f/http_request_rules/1"
            ]
        );
    }

    #[test]
    fn unstructured_directives_force_raw_fallback() {
        let desired = parse("backend api\n  stick-table type ip size 1m\n  server s 10.0.0.1:80\n").unwrap();
        let live = Config::default();
        let plan = compare(&desired, &live);
        assert!(plan.requires_raw);
    }

    #[test]
    fn reentry_after_apply_is_idempotent() {
        // Re-parse the same text twice: comparing the "applied" state with
        // the desired state must yield no operations.
        let desired = parse(DESIRED).unwrap();
        let reparsed = parse(DESIRED).unwrap();
        assert!(compare(&desired, &reparsed).is_empty());
    }
}
