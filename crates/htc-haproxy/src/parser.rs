//! Configuration text parser
//!
//! Line-oriented: a section header switches context, every other line is a
//! directive interpreted in that context. Directives the structured model
//! does not know end up verbatim in the section's `extras`. `# @meta k v`
//! comments attach metadata to the next section header or server line.

use crate::error::ParseError;
use crate::model::*;

type Result<T> = std::result::Result<T, ParseError>;

/// Parse configuration text into the structured model.
pub fn parse(text: &str) -> Result<Config> {
    Parser::new().run(text)
}

enum Section {
    None,
    Global,
    Defaults,
    Frontend,
    Backend,
    Resolvers,
    Peers,
    Cache,
    Userlist,
    Mailers,
    Ring,
    Program,
    FcgiApp,
    CrtStore,
    HttpErrors,
    LogForward,
}

struct Parser {
    config: Config,
    section: Section,
    pending_metadata: Metadata,
}

impl Parser {
    fn new() -> Self {
        Self {
            config: Config::default(),
            section: Section::None,
            pending_metadata: Metadata::new(),
        }
    }

    fn run(mut self, text: &str) -> Result<Config> {
        for (idx, raw) in text.lines().enumerate() {
            let lineno = idx + 1;
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix('#') {
                self.comment(rest.trim());
                continue;
            }
            let words = split_words(line, lineno)?;
            if words.is_empty() {
                continue;
            }
            if self.try_section_header(&words, lineno)? {
                continue;
            }
            self.directive(line, &words, lineno)?;
            // Metadata comments only reach the directly following element.
            self.pending_metadata.clear();
        }
        Ok(self.config)
    }

    fn comment(&mut self, comment: &str) {
        // `# @meta key value` attaches metadata to the next element.
        if let Some(rest) = comment.strip_prefix("@meta ") {
            if let Some((key, value)) = rest.trim().split_once(char::is_whitespace) {
                self.pending_metadata
                    .insert(key.to_string(), serde_json::Value::String(value.trim().to_string()));
            }
        }
    }

    fn take_metadata(&mut self) -> Option<Metadata> {
        if self.pending_metadata.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending_metadata))
        }
    }

    fn try_section_header(&mut self, words: &[String], lineno: usize) -> Result<bool> {
        let keyword = words[0].as_str();
        let named = |words: &[String]| -> Result<String> {
            words
                .get(1)
                .cloned()
                .ok_or_else(|| ParseError::new(lineno, format!("section '{keyword}' requires a name")))
        };
        match keyword {
            "global" => self.section = Section::Global,
            "defaults" => self.section = Section::Defaults,
            "frontend" => {
                let metadata = self.take_metadata();
                self.config.frontends.push(Frontend {
                    name: named(words)?,
                    metadata,
                    ..Frontend::default()
                });
                self.section = Section::Frontend;
            }
            "backend" => {
                let metadata = self.take_metadata();
                self.config.backends.push(Backend {
                    name: named(words)?,
                    metadata,
                    ..Backend::default()
                });
                self.section = Section::Backend;
            }
            "resolvers" => {
                self.config.resolvers.push(Resolvers { name: named(words)?, ..Resolvers::default() });
                self.section = Section::Resolvers;
            }
            "peers" => {
                self.config.peers.push(Peers { name: named(words)?, ..Peers::default() });
                self.section = Section::Peers;
            }
            "cache" => {
                self.config.caches.push(Cache { name: named(words)?, ..Cache::default() });
                self.section = Section::Cache;
            }
            "userlist" => {
                self.config.userlists.push(Userlist { name: named(words)?, ..Userlist::default() });
                self.section = Section::Userlist;
            }
            "mailers" => {
                self.config.mailers.push(Mailers { name: named(words)?, ..Mailers::default() });
                self.section = Section::Mailers;
            }
            "ring" => {
                self.config.rings.push(Ring { name: named(words)?, ..Ring::default() });
                self.section = Section::Ring;
            }
            "program" => {
                self.config.programs.push(Program { name: named(words)?, ..Program::default() });
                self.section = Section::Program;
            }
            "fcgi-app" => {
                self.config.fcgi_apps.push(FcgiApp { name: named(words)?, ..FcgiApp::default() });
                self.section = Section::FcgiApp;
            }
            "crt-store" => {
                self.config.crt_stores.push(CrtStore { name: named(words)?, ..CrtStore::default() });
                self.section = Section::CrtStore;
            }
            "http-errors" => {
                self.config
                    .http_errors_sections
                    .push(HttpErrorsSection { name: named(words)?, ..HttpErrorsSection::default() });
                self.section = Section::HttpErrors;
            }
            "log-forward" => {
                self.config
                    .log_forwards
                    .push(LogForward { name: named(words)?, ..LogForward::default() });
                self.section = Section::LogForward;
            }
            "listen" => {
                return Err(ParseError::new(
                    lineno,
                    "'listen' sections are not supported; split into frontend and backend",
                ));
            }
            _ => return Ok(false),
        }
        self.pending_metadata.clear();
        Ok(true)
    }

    fn directive(&mut self, line: &str, words: &[String], lineno: usize) -> Result<()> {
        match self.section {
            Section::None => Err(ParseError::new(
                lineno,
                format!("directive '{}' outside of any section", words[0]),
            )),
            Section::Global => self.global_directive(line, words, lineno),
            Section::Defaults => self.defaults_directive(line, words, lineno),
            Section::Frontend => self.frontend_directive(line, words, lineno),
            Section::Backend => self.backend_directive(line, words, lineno),
            Section::Resolvers => self.resolvers_directive(line, words, lineno),
            Section::Peers => self.peers_directive(line, words, lineno),
            Section::Cache => self.cache_directive(line, words, lineno),
            Section::Userlist => self.userlist_directive(words, lineno),
            Section::Mailers => self.mailers_directive(line, words, lineno),
            Section::Ring => self.ring_directive(line, words, lineno),
            Section::Program => self.program_directive(line, words),
            Section::FcgiApp => self.fcgi_directive(line, words),
            Section::CrtStore => self.crt_store_directive(line, words),
            Section::HttpErrors => self.http_errors_directive(line, words, lineno),
            Section::LogForward => self.log_forward_directive(line, words, lineno),
        }
    }

    fn global_directive(&mut self, line: &str, words: &[String], lineno: usize) -> Result<()> {
        let global = &mut self.config.global;
        match words[0].as_str() {
            "maxconn" => global.maxconn = Some(int_arg(words, 1, lineno)?),
            "daemon" => global.daemon = Some(true),
            "user" => global.user = words.get(1).cloned(),
            "group" => global.group = words.get(1).cloned(),
            "chroot" => global.chroot = words.get(1).cloned(),
            "pidfile" => global.pidfile = words.get(1).cloned(),
            "stats" if words.get(1).map(String::as_str) == Some("socket") => {
                global.stats_socket = words.get(2).cloned();
            }
            "log" => match parse_log_target(words) {
                Some(target) => global.log_targets.push(target),
                None => global.extras.push(line.to_string()),
            },
            _ => global.extras.push(line.to_string()),
        }
        Ok(())
    }

    fn defaults_directive(&mut self, line: &str, words: &[String], lineno: usize) -> Result<()> {
        let defaults = &mut self.config.defaults;
        match words[0].as_str() {
            "mode" => defaults.mode = Some(parse_mode(words, lineno)?),
            "maxconn" => defaults.maxconn = Some(int_arg(words, 1, lineno)?),
            "retries" => defaults.retries = Some(int_arg(words, 1, lineno)?),
            "timeout" => {
                let value = time_arg(words, 2, lineno)?;
                match words.get(1).map(String::as_str) {
                    Some("client") => defaults.client_timeout = Some(value),
                    Some("server") => defaults.server_timeout = Some(value),
                    Some("connect") => defaults.connect_timeout = Some(value),
                    Some("http-request") => defaults.http_request_timeout = Some(value),
                    _ => defaults.extras.push(line.to_string()),
                }
            }
            "errorfile" => defaults.error_files.push(parse_errorfile(words, lineno)?),
            "log" => match parse_log_target(words) {
                Some(target) => defaults.log_targets.push(target),
                None => defaults.extras.push(line.to_string()),
            },
            _ => defaults.extras.push(line.to_string()),
        }
        Ok(())
    }

    fn frontend_directive(&mut self, line: &str, words: &[String], lineno: usize) -> Result<()> {
        let frontend = self
            .config
            .frontends
            .last_mut()
            .ok_or_else(|| ParseError::new(lineno, "internal: no current frontend"))?;
        match words[0].as_str() {
            "mode" => frontend.mode = Some(parse_mode(words, lineno)?),
            "maxconn" => frontend.maxconn = Some(int_arg(words, 1, lineno)?),
            "default_backend" => frontend.default_backend = words.get(1).cloned(),
            "bind" => frontend.binds.push(parse_bind(words, lineno)?),
            "acl" => frontend.acls.push(parse_acl(words, lineno)?),
            "use_backend" => {
                let name = arg(words, 1, lineno, "use_backend requires a backend name")?;
                let (cond, cond_test) = split_condition(words.get(2..).unwrap_or(&[]));
                frontend.backend_switching_rules.push(BackendSwitchingRule {
                    name,
                    cond,
                    cond_test,
                });
            }
            "http-request" => match parse_http_request_rule(words) {
                Some(rule) => frontend.http_request_rules.push(rule),
                None => frontend.extras.push(line.to_string()),
            },
            "http-response" => match parse_http_response_rule(words) {
                Some(rule) => frontend.http_response_rules.push(rule),
                None => frontend.extras.push(line.to_string()),
            },
            "tcp-request" => match parse_tcp_request_rule(words) {
                Some(rule) => frontend.tcp_request_rules.push(rule),
                None => frontend.extras.push(line.to_string()),
            },
            "capture" => match parse_capture(words) {
                Some(capture) => frontend.captures.push(capture),
                None => frontend.extras.push(line.to_string()),
            },
            "filter" => match parse_filter(words) {
                Some(filter) => frontend.filters.push(filter),
                None => frontend.extras.push(line.to_string()),
            },
            "log" => match parse_log_target(words) {
                Some(target) => frontend.log_targets.push(target),
                None => frontend.extras.push(line.to_string()),
            },
            _ => frontend.extras.push(line.to_string()),
        }
        Ok(())
    }

    fn backend_directive(&mut self, line: &str, words: &[String], lineno: usize) -> Result<()> {
        let metadata = self.take_metadata();
        let backend = self
            .config
            .backends
            .last_mut()
            .ok_or_else(|| ParseError::new(lineno, "internal: no current backend"))?;
        match words[0].as_str() {
            "mode" => backend.mode = Some(parse_mode(words, lineno)?),
            "balance" => {
                backend.balance = Some(Balance {
                    algorithm: arg(words, 1, lineno, "balance requires an algorithm")?,
                });
            }
            "server" => {
                let mut server = parse_server(words, lineno)?;
                server.metadata = metadata;
                backend.servers.push(server);
            }
            "server-template" => backend.server_templates.push(parse_server_template(words, lineno)?),
            "acl" => backend.acls.push(parse_acl(words, lineno)?),
            "http-request" => match parse_http_request_rule(words) {
                Some(rule) => backend.http_request_rules.push(rule),
                None => backend.extras.push(line.to_string()),
            },
            "http-response" => match parse_http_response_rule(words) {
                Some(rule) => backend.http_response_rules.push(rule),
                None => backend.extras.push(line.to_string()),
            },
            "http-check" => match parse_http_check(words) {
                Some(check) => backend.http_checks.push(check),
                None => backend.extras.push(line.to_string()),
            },
            "option" if words.get(1).map(String::as_str) == Some("httpchk") => {
                backend.httpchk_params = Some(HttpchkParams {
                    method: words.get(2).cloned(),
                    uri: words.get(3).cloned(),
                    version: words.get(4).cloned(),
                });
            }
            "filter" => match parse_filter(words) {
                Some(filter) => backend.filters.push(filter),
                None => backend.extras.push(line.to_string()),
            },
            "log" => match parse_log_target(words) {
                Some(target) => backend.log_targets.push(target),
                None => backend.extras.push(line.to_string()),
            },
            _ => backend.extras.push(line.to_string()),
        }
        Ok(())
    }

    fn resolvers_directive(&mut self, line: &str, words: &[String], lineno: usize) -> Result<()> {
        let section = self
            .config
            .resolvers
            .last_mut()
            .ok_or_else(|| ParseError::new(lineno, "internal: no current resolvers"))?;
        if words[0] == "nameserver" {
            let name = arg(words, 1, lineno, "nameserver requires a name")?;
            let addr = arg(words, 2, lineno, "nameserver requires an address")?;
            let (address, port) = split_address(&addr);
            section.nameservers.push(Nameserver { name, address, port });
        } else {
            section.extras.push(line.to_string());
        }
        Ok(())
    }

    fn peers_directive(&mut self, line: &str, words: &[String], lineno: usize) -> Result<()> {
        let section = self
            .config
            .peers
            .last_mut()
            .ok_or_else(|| ParseError::new(lineno, "internal: no current peers"))?;
        if words[0] == "peer" {
            let name = arg(words, 1, lineno, "peer requires a name")?;
            let addr = arg(words, 2, lineno, "peer requires an address")?;
            let (address, port) = split_address(&addr);
            let port = port
                .ok_or_else(|| ParseError::new(lineno, format!("peer '{name}' requires a port")))?;
            section.peer_entries.push(PeerEntry { name, address, port });
        } else {
            section.extras.push(line.to_string());
        }
        Ok(())
    }

    fn cache_directive(&mut self, line: &str, words: &[String], lineno: usize) -> Result<()> {
        let section = self
            .config
            .caches
            .last_mut()
            .ok_or_else(|| ParseError::new(lineno, "internal: no current cache"))?;
        match words[0].as_str() {
            "total-max-size" => section.total_max_size = Some(int_arg(words, 1, lineno)?),
            "max-age" => section.max_age = Some(int_arg(words, 1, lineno)?),
            _ => section.extras.push(line.to_string()),
        }
        Ok(())
    }

    fn userlist_directive(&mut self, words: &[String], lineno: usize) -> Result<()> {
        let section = self
            .config
            .userlists
            .last_mut()
            .ok_or_else(|| ParseError::new(lineno, "internal: no current userlist"))?;
        match words[0].as_str() {
            "user" => {
                let username = arg(words, 1, lineno, "user requires a name")?;
                let (secure, password) = match words.get(2).map(String::as_str) {
                    Some("password") => (true, arg(words, 3, lineno, "user requires a password")?),
                    Some("insecure-password") => {
                        (false, arg(words, 3, lineno, "user requires a password")?)
                    }
                    _ => {
                        return Err(ParseError::new(
                            lineno,
                            format!("user '{username}' requires password or insecure-password"),
                        ));
                    }
                };
                let groups = words
                    .iter()
                    .position(|w| w == "groups")
                    .and_then(|i| words.get(i + 1))
                    .cloned();
                section.users.push(User {
                    username,
                    password,
                    secure_password: Some(secure),
                    groups,
                });
            }
            "group" => {
                let name = arg(words, 1, lineno, "group requires a name")?;
                let users = words
                    .iter()
                    .position(|w| w == "users")
                    .and_then(|i| words.get(i + 1))
                    .cloned();
                section.groups.push(Group { name, users });
            }
            other => {
                return Err(ParseError::new(
                    lineno,
                    format!("unexpected directive '{other}' in userlist"),
                ));
            }
        }
        Ok(())
    }

    fn mailers_directive(&mut self, line: &str, words: &[String], lineno: usize) -> Result<()> {
        let section = self
            .config
            .mailers
            .last_mut()
            .ok_or_else(|| ParseError::new(lineno, "internal: no current mailers"))?;
        if words[0] == "mailer" {
            let name = arg(words, 1, lineno, "mailer requires a name")?;
            let addr = arg(words, 2, lineno, "mailer requires an address")?;
            let (address, port) = split_address(&addr);
            let port = port
                .ok_or_else(|| ParseError::new(lineno, format!("mailer '{name}' requires a port")))?;
            section.mailer_entries.push(MailerEntry { name, address, port });
        } else {
            section.extras.push(line.to_string());
        }
        Ok(())
    }

    fn ring_directive(&mut self, line: &str, words: &[String], lineno: usize) -> Result<()> {
        let section = self
            .config
            .rings
            .last_mut()
            .ok_or_else(|| ParseError::new(lineno, "internal: no current ring"))?;
        match words[0].as_str() {
            "format" => section.format = words.get(1).cloned(),
            "size" => section.size = Some(int_arg(words, 1, lineno)?),
            _ => section.extras.push(line.to_string()),
        }
        Ok(())
    }

    fn program_directive(&mut self, line: &str, words: &[String]) -> Result<()> {
        if let Some(section) = self.config.programs.last_mut() {
            if words[0] == "command" {
                section.command = Some(words[1..].join(" "));
            } else {
                section.extras.push(line.to_string());
            }
        }
        Ok(())
    }

    fn fcgi_directive(&mut self, line: &str, words: &[String]) -> Result<()> {
        if let Some(section) = self.config.fcgi_apps.last_mut() {
            match words[0].as_str() {
                "docroot" => section.docroot = words.get(1).cloned(),
                "index" => section.index = words.get(1).cloned(),
                _ => section.extras.push(line.to_string()),
            }
        }
        Ok(())
    }

    fn crt_store_directive(&mut self, line: &str, words: &[String]) -> Result<()> {
        if let Some(section) = self.config.crt_stores.last_mut() {
            match words[0].as_str() {
                "crt-base" => section.crt_base = words.get(1).cloned(),
                "key-base" => section.key_base = words.get(1).cloned(),
                _ => section.extras.push(line.to_string()),
            }
        }
        Ok(())
    }

    fn http_errors_directive(&mut self, line: &str, words: &[String], lineno: usize) -> Result<()> {
        let _ = line;
        let section = self
            .config
            .http_errors_sections
            .last_mut()
            .ok_or_else(|| ParseError::new(lineno, "internal: no current http-errors"))?;
        if words[0] == "errorfile" {
            section.error_files.push(parse_errorfile(words, lineno)?);
            Ok(())
        } else {
            Err(ParseError::new(
                lineno,
                format!("unexpected directive '{}' in http-errors", words[0]),
            ))
        }
    }

    fn log_forward_directive(&mut self, line: &str, words: &[String], lineno: usize) -> Result<()> {
        let section = self
            .config
            .log_forwards
            .last_mut()
            .ok_or_else(|| ParseError::new(lineno, "internal: no current log-forward"))?;
        match words[0].as_str() {
            "bind" => section.binds.push(parse_bind(words, lineno)?),
            "log" => match parse_log_target(words) {
                Some(target) => section.log_targets.push(target),
                None => section.extras.push(line.to_string()),
            },
            _ => section.extras.push(line.to_string()),
        }
        Ok(())
    }
}

/// Split a directive line into words, honoring single and double quotes.
fn split_words(line: &str, lineno: usize) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    let mut quote: Option<char> = None;
    let mut in_word = false;
    while let Some(ch) = chars.next() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                } else if ch == '\\' && q == '"' {
                    if let Some(escaped) = chars.next() {
                        current.push(escaped);
                    }
                } else {
                    current.push(ch);
                }
            }
            None => match ch {
                '"' | '\'' => {
                    quote = Some(ch);
                    in_word = true;
                }
                '#' => break,
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                c => {
                    current.push(c);
                    in_word = true;
                }
            },
        }
    }
    if quote.is_some() {
        return Err(ParseError::new(lineno, "unterminated quote"));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

fn arg(words: &[String], idx: usize, lineno: usize, msg: &str) -> Result<String> {
    words.get(idx).cloned().ok_or_else(|| ParseError::new(lineno, msg))
}

fn int_arg(words: &[String], idx: usize, lineno: usize) -> Result<i64> {
    let raw = words
        .get(idx)
        .ok_or_else(|| ParseError::new(lineno, format!("'{}' requires a number", words[0])))?;
    raw.parse()
        .map_err(|_| ParseError::new(lineno, format!("'{raw}' is not a valid number")))
}

/// Parse a time value into milliseconds. A bare number is milliseconds.
fn time_arg(words: &[String], idx: usize, lineno: usize) -> Result<i64> {
    let raw = words
        .get(idx)
        .ok_or_else(|| ParseError::new(lineno, "timeout requires a value"))?;
    let (digits, multiplier) = match raw {
        r if r.ends_with("ms") => (&r[..r.len() - 2], 1),
        r if r.ends_with('s') => (&r[..r.len() - 1], 1_000),
        r if r.ends_with('m') => (&r[..r.len() - 1], 60_000),
        r if r.ends_with('h') => (&r[..r.len() - 1], 3_600_000),
        r if r.ends_with('d') => (&r[..r.len() - 1], 86_400_000),
        r => (r.as_str(), 1),
    };
    let value: i64 = digits
        .parse()
        .map_err(|_| ParseError::new(lineno, format!("'{raw}' is not a valid time value")))?;
    Ok(value * multiplier)
}

fn parse_mode(words: &[String], lineno: usize) -> Result<Mode> {
    match words.get(1).map(String::as_str) {
        Some("http") => Ok(Mode::Http),
        Some("tcp") => Ok(Mode::Tcp),
        other => Err(ParseError::new(
            lineno,
            format!("mode must be 'http' or 'tcp', got {other:?}"),
        )),
    }
}

/// `addr[:port]`, with IPv6 brackets and `*` wildcards.
fn split_address(addr: &str) -> (String, Option<i64>) {
    if let Some(rest) = addr.strip_prefix('[') {
        // [::1]:8080
        if let Some((host, port)) = rest.split_once(']') {
            let port = port.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host.to_string(), port);
        }
    }
    match addr.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), Some(port)),
            Err(_) => (addr.to_string(), None),
        },
        None => (addr.to_string(), None),
    }
}

fn parse_bind(words: &[String], lineno: usize) -> Result<Bind> {
    let addr = arg(words, 1, lineno, "bind requires an address")?;
    let (address, port) = split_address(&addr);
    let mut bind = Bind {
        name: addr.clone(),
        address: Some(address),
        port,
        ..Bind::default()
    };
    let mut iter = words[2..].iter();
    while let Some(param) = iter.next() {
        match param.as_str() {
            "ssl" => bind.ssl = Some(true),
            "crt" => bind.ssl_certificate = iter.next().cloned(),
            "alpn" => bind.alpn = iter.next().cloned(),
            "accept-proxy" => bind.accept_proxy = Some(true),
            _ => {}
        }
    }
    Ok(bind)
}

fn parse_acl(words: &[String], lineno: usize) -> Result<Acl> {
    Ok(Acl {
        acl_name: arg(words, 1, lineno, "acl requires a name")?,
        criterion: arg(words, 2, lineno, "acl requires a criterion")?,
        value: words[3..].join(" "),
    })
}

fn parse_server(words: &[String], lineno: usize) -> Result<Server> {
    let name = arg(words, 1, lineno, "server requires a name")?;
    let addr = arg(words, 2, lineno, "server requires an address")?;
    let (address, port) = split_address(&addr);
    let mut server = Server { name, address, port, ..Server::default() };
    let mut iter = words[3..].iter();
    while let Some(param) = iter.next() {
        match param.as_str() {
            "check" => server.check = Some("enabled".to_string()),
            "backup" => server.backup = Some(true),
            "disabled" => server.maintenance = Some("enabled".to_string()),
            "ssl" => server.ssl = Some("enabled".to_string()),
            "verify" => server.verify = iter.next().cloned(),
            "weight" => server.weight = next_int(&mut iter, lineno, "weight")?,
            "maxconn" => server.maxconn = next_int(&mut iter, lineno, "maxconn")?,
            "rise" => server.rise = next_int(&mut iter, lineno, "rise")?,
            "fall" => server.fall = next_int(&mut iter, lineno, "fall")?,
            "inter" => {
                let raw = iter
                    .next()
                    .ok_or_else(|| ParseError::new(lineno, "inter requires a value"))?;
                server.inter = Some(time_arg(&["inter".into(), raw.clone()], 1, lineno)?);
            }
            _ => {}
        }
    }
    Ok(server)
}

fn next_int<'a>(
    iter: &mut impl Iterator<Item = &'a String>,
    lineno: usize,
    param: &str,
) -> Result<Option<i64>> {
    let raw = iter
        .next()
        .ok_or_else(|| ParseError::new(lineno, format!("{param} requires a value")))?;
    let value = raw
        .parse()
        .map_err(|_| ParseError::new(lineno, format!("'{raw}' is not a valid number")))?;
    Ok(Some(value))
}

fn parse_server_template(words: &[String], lineno: usize) -> Result<ServerTemplate> {
    let prefix = arg(words, 1, lineno, "server-template requires a prefix")?;
    let num_or_range = arg(words, 2, lineno, "server-template requires a count or range")?;
    let addr = arg(words, 3, lineno, "server-template requires an address")?;
    let (fqdn, port) = split_address(&addr);
    let check = words[4..]
        .iter()
        .any(|w| w == "check")
        .then(|| "enabled".to_string());
    Ok(ServerTemplate { prefix, num_or_range, fqdn, port, check })
}

/// Locate a trailing `if`/`unless` condition.
fn split_condition(words: &[String]) -> (Option<String>, Option<String>) {
    for (i, word) in words.iter().enumerate() {
        if word == "if" || word == "unless" {
            return (Some(word.clone()), Some(words[i + 1..].join(" ")));
        }
    }
    (None, None)
}

fn parse_http_request_rule(words: &[String]) -> Option<HttpRequestRule> {
    let type_ = words.get(1)?.clone();
    let (cond, cond_test) = split_condition(&words[2..]);
    let args: Vec<&String> = words[2..]
        .iter()
        .take_while(|w| *w != "if" && *w != "unless")
        .collect();
    let mut rule = HttpRequestRule { cond, cond_test, ..HttpRequestRule::default() };
    match type_.as_str() {
        "allow" if args.is_empty() => rule.type_ = "allow".into(),
        "deny" => {
            rule.type_ = "deny".into();
            if args.first().map(|a| a.as_str()) == Some("deny_status") {
                rule.deny_status = args.get(1).and_then(|a| a.parse().ok());
            } else if !args.is_empty() {
                return None;
            }
        }
        "auth" => {
            rule.type_ = "auth".into();
            if args.first().map(|a| a.as_str()) == Some("realm") {
                rule.auth_realm = args.get(1).map(|a| a.to_string());
            } else if !args.is_empty() {
                return None;
            }
        }
        "set-header" | "add-header" => {
            rule.type_ = type_.clone();
            rule.hdr_name = args.first().map(|a| a.to_string());
            rule.hdr_format =
                Some(args[1..].iter().map(|a| a.as_str()).collect::<Vec<_>>().join(" "));
        }
        "del-header" => {
            rule.type_ = "del-header".into();
            rule.hdr_name = args.first().map(|a| a.to_string());
        }
        "redirect" => {
            rule.type_ = "redirect".into();
            rule.redir_type = args.first().map(|a| a.to_string());
            rule.redir_value = args.get(1).map(|a| a.to_string());
            if args.get(2).map(|a| a.as_str()) == Some("code") {
                rule.redir_code = args.get(3).and_then(|a| a.parse().ok());
            }
        }
        "use-service" => {
            rule.type_ = "use-service".into();
            rule.service_name = args.first().map(|a| a.to_string());
        }
        t if t.starts_with("set-var(") => {
            rule.type_ = "set-var".into();
            rule.var_name = t
                .strip_prefix("set-var(")
                .and_then(|r| r.strip_suffix(')'))
                .map(str::to_string);
            rule.var_expr =
                Some(args.iter().map(|a| a.as_str()).collect::<Vec<_>>().join(" "));
        }
        _ => return None,
    }
    Some(rule)
}

fn parse_http_check(words: &[String]) -> Option<HttpCheck> {
    let type_ = words.get(1)?.clone();
    let args: Vec<&String> = words[2..].iter().collect();
    let mut check = HttpCheck { type_: type_.clone(), ..HttpCheck::default() };
    match type_.as_str() {
        "send" => {
            let mut i = 0;
            while i < args.len() {
                match args[i].as_str() {
                    "meth" => check.method = args.get(i + 1).map(|a| a.to_string()),
                    "uri" => check.uri = args.get(i + 1).map(|a| a.to_string()),
                    _ => {}
                }
                i += 1;
            }
        }
        "expect" => {
            check.match_ = args.first().map(|a| a.to_string());
            check.pattern = args.get(1).map(|a| a.to_string());
        }
        "connect" | "disable-on-404" | "comment" => {}
        _ => return None,
    }
    Some(check)
}

fn parse_http_response_rule(words: &[String]) -> Option<HttpResponseRule> {
    let type_ = words.get(1)?.clone();
    let (cond, cond_test) = split_condition(&words[2..]);
    let args: Vec<&String> = words[2..]
        .iter()
        .take_while(|w| *w != "if" && *w != "unless")
        .collect();
    let mut rule = HttpResponseRule { cond, cond_test, ..HttpResponseRule::default() };
    match type_.as_str() {
        "allow" | "deny" if args.is_empty() => rule.type_ = type_.clone(),
        "set-header" | "add-header" => {
            rule.type_ = type_.clone();
            rule.hdr_name = args.first().map(|a| a.to_string());
            rule.hdr_format =
                Some(args[1..].iter().map(|a| a.as_str()).collect::<Vec<_>>().join(" "));
        }
        "del-header" => {
            rule.type_ = "del-header".into();
            rule.hdr_name = args.first().map(|a| a.to_string());
        }
        "set-status" => {
            rule.type_ = "set-status".into();
            rule.status = args.first().and_then(|a| a.parse().ok());
        }
        _ => return None,
    }
    Some(rule)
}

fn parse_tcp_request_rule(words: &[String]) -> Option<TcpRequestRule> {
    let type_ = words.get(1)?.as_str();
    if !matches!(type_, "connection" | "content" | "session") {
        return None;
    }
    let action = words.get(2)?.clone();
    let (cond, cond_test) = split_condition(&words[3..]);
    Some(TcpRequestRule { type_: type_.to_string(), action, cond, cond_test })
}

fn parse_capture(words: &[String]) -> Option<Capture> {
    // capture request|response header NAME len N
    let type_ = words.get(1)?.as_str();
    if !matches!(type_, "request" | "response") || words.get(2)?.as_str() != "header" {
        return None;
    }
    let header = words.get(3)?.clone();
    if words.get(4)?.as_str() != "len" {
        return None;
    }
    let length = words.get(5)?.parse().ok()?;
    Some(Capture { type_: type_.to_string(), header, length })
}

fn parse_filter(words: &[String]) -> Option<Filter> {
    let type_ = words.get(1)?.clone();
    match type_.as_str() {
        "trace" | "compression" => Some(Filter { type_, ..Filter::default() }),
        "spoe" => {
            let mut filter = Filter { type_, ..Filter::default() };
            let mut iter = words[2..].iter();
            while let Some(param) = iter.next() {
                match param.as_str() {
                    "engine" => filter.spoe_engine = iter.next().cloned(),
                    "config" => filter.spoe_config = iter.next().cloned(),
                    _ => {}
                }
            }
            Some(filter)
        }
        _ => None,
    }
}

/// `log ADDR FACILITY [LEVEL]`; anything fancier stays raw.
fn parse_log_target(words: &[String]) -> Option<LogTarget> {
    if words.len() < 3 || words[1] == "global" {
        return None;
    }
    let level = words.get(3).cloned();
    if words.len() > 4 {
        return None;
    }
    Some(LogTarget {
        address: words[1].clone(),
        facility: words[2].clone(),
        level,
    })
}

fn parse_errorfile(words: &[String], lineno: usize) -> Result<ErrorFile> {
    Ok(ErrorFile {
        code: int_arg(words, 1, lineno)?,
        file: arg(words, 2, lineno, "errorfile requires a file path")?,
    })
}
