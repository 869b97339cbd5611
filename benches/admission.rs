use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use execgate::command::{CommandRequest, CommandValidator};
use execgate::identity::Identity;
use execgate::rate_limit::{RateLimitConfig, RateLimiter};
use std::hint::black_box;
use std::time::Duration;

fn bench_validator(c: &mut Criterion) {
    let validator = CommandValidator::default();

    let accepted = CommandRequest::new(
        Identity::new("alice"),
        "call-tool",
        ["search", "query=rust async", "limit=10", r#"filter={"lang":"en","tags":["a","b"]}"#],
    );
    let injected = CommandRequest::new(Identity::new("alice"), "enable-server", ["github", "x; rm -rf /"]);

    c.bench_function("validate_accepted", |b| {
        b.iter(|| black_box(validator.validate(black_box(&accepted))));
    });
    c.bench_function("validate_injection", |b| {
        b.iter(|| black_box(validator.validate(black_box(&injected))));
    });

    let mut group = c.benchmark_group("validate_variadic");
    for count in [1usize, 4, 16] {
        let servers: Vec<String> = (0..count).map(|i| format!("server-{}", i)).collect();
        let request = CommandRequest::new(Identity::new("alice"), "enable-server", servers);
        group.bench_with_input(BenchmarkId::from_parameter(count), &request, |b, request| {
            b.iter(|| black_box(validator.validate(request)));
        });
    }
    group.finish();
}

fn bench_rate_limiter(c: &mut Criterion) {
    let limiter = RateLimiter::new(RateLimitConfig::per_window(u32::MAX, Duration::from_secs(60)));
    let identity = Identity::new("alice");
    c.bench_function("admit_single_principal", |b| {
        b.iter(|| black_box(limiter.admit(&identity, "list-servers")));
    });

    let identities: Vec<Identity> = (0..1000).map(|i| Identity::new(format!("user-{}", i))).collect();
    let mut next = 0;
    c.bench_function("admit_many_principals", |b| {
        b.iter(|| {
            next = (next + 1) % identities.len();
            black_box(limiter.admit(&identities[next], "list-servers"))
        });
    });
}

fn bench_admission(c: &mut Criterion) {
    let validator = CommandValidator::default();
    let limiter = RateLimiter::new(RateLimitConfig::per_window(u32::MAX, Duration::from_secs(60)));
    let request = CommandRequest::new(Identity::new("alice"), "inspect-server", ["github"]);

    c.bench_function("admission_path", |b| {
        b.iter(|| {
            // Limiter first, as in the gateway
            let decision = limiter.admit(request.identity(), request.operation());
            black_box(decision);
            black_box(validator.validate(&request))
        });
    });
}

criterion_group!(benches, bench_validator, bench_rate_limiter, bench_admission);
criterion_main!(benches);
