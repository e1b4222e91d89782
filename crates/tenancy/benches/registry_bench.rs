use criterion::{Criterion, criterion_group, criterion_main};
use tenancy::{InMemoryConnectionFactory, InMemoryDirectory, RegistryConfig, TenantRegistry};

fn bench_acquire_cache_hit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let directory = InMemoryDirectory::new();
    let registry = TenantRegistry::new(
        directory.clone(),
        InMemoryConnectionFactory::new(),
        RegistryConfig::default(),
    );
    let tenant = rt.block_on(async {
        let tenant = directory.register("store_1").await;
        registry.acquire(tenant).await.unwrap();
        tenant
    });

    c.bench_function("registry/acquire_cache_hit", |b| {
        b.iter(|| {
            rt.block_on(async {
                registry.acquire(tenant).await.unwrap();
            });
        });
    });
}

fn bench_acquire_with_eviction(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let directory = InMemoryDirectory::new();
    let registry = TenantRegistry::new(
        directory.clone(),
        InMemoryConnectionFactory::new(),
        RegistryConfig::default().with_max_connections(50),
    );
    let tenants = rt.block_on(async {
        let mut tenants = Vec::new();
        for i in 0..200 {
            tenants.push(directory.register(format!("store_{i}")).await);
        }
        tenants
    });

    let mut next = 0;
    c.bench_function("registry/acquire_rotating_200_tenants_cap_50", |b| {
        b.iter(|| {
            let tenant = tenants[next % tenants.len()];
            next += 1;
            rt.block_on(async {
                registry.acquire(tenant).await.unwrap();
            });
        });
    });
}

criterion_group!(benches, bench_acquire_cache_hit, bench_acquire_with_eviction);
criterion_main!(benches);
