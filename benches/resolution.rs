use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};

use kyro_resolve::normalize::{normalize, trigram_similarity, trigrams};
use kyro_resolve::{
    BloomFilter, EntityResolver, EntityType, Mention, OrgId, Provenance, ResolutionConfig, TextSpan,
};

const COMPANIES: &[&str] = &[
    "Acme Corporation",
    "Globex",
    "Initech",
    "Umbrella Corp",
    "Hooli",
    "Stark Industries",
    "Wayne Enterprises",
    "Cyberdyne Systems",
];

fn mention(org: OrgId, text: &str) -> Mention {
    Mention::builder()
        .org(org)
        .text(text)
        .mention_type(EntityType::Organization)
        .confidence(0.9)
        .provenance(Provenance::new("bench", "doc", TextSpan::new(0, text.len()).unwrap(), text))
        .build()
        .unwrap()
}

/// Resolver seeded with 256 distinct entities in one organization.
fn seeded_resolver() -> (EntityResolver, OrgId) {
    let resolver = EntityResolver::in_memory(ResolutionConfig::default()).unwrap();
    let org = OrgId::new();
    let batch = (0..256)
        .map(|i| mention(org, &format!("{} {i}", COMPANIES[i % COMPANIES.len()])))
        .collect();
    let result = resolver.cluster(org, batch);
    assert!(result.is_complete());
    (resolver, org)
}

fn bench_normalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("text");
    group.throughput(Throughput::Elements(COMPANIES.len() as u64));
    group.bench_function("normalize", |b| {
        b.iter(|| {
            for name in COMPANIES {
                std::hint::black_box(normalize(name));
            }
        });
    });
    group.bench_function("trigram_similarity", |b| {
        let left = trigrams(&normalize("Stark Industries Inc."));
        let right = trigrams(&normalize("stark industries"));
        b.iter(|| std::hint::black_box(trigram_similarity(&left, &right)));
    });
    group.finish();
}

fn bench_bloom(c: &mut Criterion) {
    let mut filter = BloomFilter::with_capacity(10_000, 0.01);
    for i in 0..5_000 {
        filter.insert(&format!("entity {i}"));
    }
    c.bench_function("bloom/contains", |b| {
        b.iter(|| std::hint::black_box(filter.may_contain("entity 4321")));
    });
}

fn bench_find_candidates(c: &mut Criterion) {
    let (resolver, org) = seeded_resolver();
    let query = mention(org, "Stark Industries 42");
    c.bench_function("registry/find_candidates", |b| {
        b.iter(|| std::hint::black_box(resolver.find_candidates(&query).unwrap()));
    });
}

fn bench_cluster_batch(c: &mut Criterion) {
    c.bench_function("cluster/batch_64", |b| {
        b.iter_batched(
            || {
                let (resolver, org) = seeded_resolver();
                let batch = (0..64)
                    .map(|i| mention(org, &format!("{} {}", COMPANIES[i % COMPANIES.len()], i * 4)))
                    .collect::<Vec<_>>();
                (resolver, org, batch)
            },
            |(resolver, org, batch)| std::hint::black_box(resolver.cluster(org, batch)),
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(
    benches,
    bench_normalize,
    bench_bloom,
    bench_find_candidates,
    bench_cluster_batch
);
criterion_main!(benches);
