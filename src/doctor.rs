use std::collections::HashSet;

use lisa_core::config::AppConfig;

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

impl CheckResult {
    fn ok(label: &str, detail: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ok: true,
            detail: detail.into(),
        }
    }

    fn fail(label: &str, detail: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ok: false,
            detail: detail.into(),
        }
    }
}

pub fn run_doctor(config: &AppConfig) {
    let mut checks = vec![
        check_workspace(config),
        check_breaker(config),
        check_retry(config),
        check_coordinator(config),
    ];
    checks.extend(check_providers(config));

    let mut ok_count = 0;
    let mut fail_count = 0;

    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
}

fn check_workspace(config: &AppConfig) -> CheckResult {
    let ws = config.workspace_dir();
    if !ws.is_dir() {
        return CheckResult::fail("Workspace", format!("{} (does not exist)", ws.display()));
    }
    // Writable if a scratch file can be created
    let probe = ws.join(".doctor_test");
    match std::fs::write(&probe, "test") {
        Ok(_) => {
            std::fs::remove_file(&probe).ok();
            CheckResult::ok("Workspace", ws.display().to_string())
        }
        Err(e) => CheckResult::fail("Workspace", format!("{} (not writable: {})", ws.display(), e)),
    }
}

fn check_breaker(config: &AppConfig) -> CheckResult {
    let b = &config.breaker;
    if b.failure_threshold == 0 {
        CheckResult::fail("Circuit breaker", "failure_threshold must be at least 1")
    } else if b.success_threshold == 0 || b.half_open_max_calls == 0 {
        CheckResult::fail(
            "Circuit breaker",
            "success_threshold and half_open_max_calls must be at least 1",
        )
    } else if b.success_threshold > b.half_open_max_calls {
        CheckResult::fail(
            "Circuit breaker",
            format!(
                "success_threshold ({}) exceeds half_open_max_calls ({}); half-open circuits close slowly",
                b.success_threshold, b.half_open_max_calls
            ),
        )
    } else {
        CheckResult::ok(
            "Circuit breaker",
            format!(
                "opens after {} failures, probes after {}ms",
                b.failure_threshold, b.reset_timeout_ms
            ),
        )
    }
}

fn check_retry(config: &AppConfig) -> CheckResult {
    let r = &config.retry;
    if r.max_attempts == 0 {
        CheckResult::fail("Retry", "max_attempts must be at least 1")
    } else if r.timeout_ms == 0 {
        CheckResult::fail("Retry", "timeout_ms must be positive")
    } else if r.backoff_multiplier < 1.0 {
        CheckResult::fail(
            "Retry",
            format!("backoff_multiplier {} shrinks delays", r.backoff_multiplier),
        )
    } else if r.initial_delay_ms > r.max_delay_ms {
        CheckResult::fail(
            "Retry",
            format!(
                "initial_delay_ms ({}) exceeds max_delay_ms ({})",
                r.initial_delay_ms, r.max_delay_ms
            ),
        )
    } else {
        CheckResult::ok(
            "Retry",
            format!("{} attempts, {}ms timeout", r.max_attempts, r.timeout_ms),
        )
    }
}

fn check_coordinator(config: &AppConfig) -> CheckResult {
    let c = &config.coordinator;
    let parallelism = match c.max_parallelism {
        Some(n) if n > 0 => n.to_string(),
        _ => "unbounded".to_string(),
    };
    if c.event_capacity == 0 {
        CheckResult::fail("Coordinator", "event_capacity must be positive")
    } else {
        CheckResult::ok(
            "Coordinator",
            format!(
                "parallelism {}, strict capabilities {}",
                parallelism, c.strict_capabilities
            ),
        )
    }
}

fn check_providers(config: &AppConfig) -> Vec<CheckResult> {
    let providers = &config.failover.providers;
    if providers.is_empty() {
        return vec![CheckResult::ok("Providers", "none configured (failover disabled)")];
    }

    let mut results = Vec::new();
    let mut seen = HashSet::new();
    for provider in providers {
        let label = format!("Provider {}", provider.name);
        if !seen.insert(provider.name.as_str()) {
            results.push(CheckResult::fail(&label, "duplicate provider name"));
            continue;
        }
        let result = match provider.endpoint.as_deref() {
            None => CheckResult::fail(&label, "no endpoint configured"),
            Some(endpoint) if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) => {
                CheckResult::fail(&label, format!("endpoint '{}' is not an http(s) URL", endpoint))
            }
            Some(_) if provider.api_key.as_deref().is_some_and(|k| k.starts_with("${")) => {
                CheckResult::fail(&label, "api_key references an unset environment variable")
            }
            Some(endpoint) => CheckResult::ok(&label, format!("priority {}, {}", provider.priority, endpoint)),
        };
        results.push(result);
    }
    results
}
