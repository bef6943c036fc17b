use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ratebudget::{
    Allocator, BudgetLayer, BudgetManager, BudgetTable, ConsumerBudget, InMemoryStateStore,
    ManualClock, RateState,
};
use ratebudget::rate_limit::{UpstreamRequest, UpstreamResponse};
use ratebudget::RateLimitInfo;

use std::sync::Arc;
use tower::{Layer, Service};
use futures::future::Ready;

// 2024-03-15T10:30:00Z
const T0: u64 = 1_710_498_600_000;

#[derive(Clone, Copy)]
struct Fetch;

impl UpstreamRequest for Fetch {
    fn endpoint(&self) -> String {
        "/v3/search/contents".to_string()
    }
}

struct Reply;

impl UpstreamResponse for Reply {
    fn rate_limit_info(&self) -> Option<RateLimitInfo> {
        Some(RateLimitInfo::from_counts(10, 1000))
    }
}

// Upstream stand-in that answers immediately.
#[derive(Clone)]
struct EchoService;

impl Service<Fetch> for EchoService {
    type Response = Reply;
    type Error = std::io::Error;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: Fetch) -> Self::Future {
        futures::future::ready(Ok(Reply))
    }
}

fn busy_state() -> RateState {
    let mut state = RateState::fresh(T0);
    for (consumer, used) in [("cyber-ops", 1000), ("twitter-bot", 120), ("landscape", 200)] {
        state.daily.by_consumer.insert(consumer.to_string(), used);
        state.daily.total += used;
    }
    state
}

fn check_budget_pure(c: &mut Criterion) {
    let allocator = Allocator::new(Arc::new(BudgetTable::default()));
    let state = busy_state();

    c.bench_function("check_budget_borrowing", |b| {
        b.iter(|| allocator.check_budget(black_box(&state), black_box("cyber-ops"), T0 + 5_000));
    });
}

fn middleware_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("runtime");
    let clock = ManualClock::new(T0);
    let manager = Arc::new(
        BudgetManager::new(InMemoryStateStore::new(), BudgetTable::default())
            .with_clock(clock.clone()),
    );
    let svc = BudgetLayer::new(ConsumerBudget::new(manager, "cyber-ops")).layer(EchoService);

    c.bench_function("budget_layer_admit_and_record", |b| {
        b.to_async(&rt).iter(|| {
            // Two minutes per call: past burst spacing, and under the daily limit per day.
            clock.advance(120_000);
            let mut local_svc = svc.clone();
            async move {
                let _ = black_box(local_svc.call(black_box(Fetch)).await);
            }
        });
    });
}

criterion_group!(benches, check_budget_pure, middleware_round_trip);
criterion_main!(benches);
