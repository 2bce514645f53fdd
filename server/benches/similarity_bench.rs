use criterion::{black_box, criterion_group, criterion_main, Criterion};
use grugthink_server::embeddings::{Embedder, HashingEmbedder, EMBED_DIM};
use grugthink_server::vector_index::{cosine_similarity, FlatIndex, VectorIndex};

fn bench_cosine(c: &mut Criterion) {
    let a: Vec<f32> = (0..EMBED_DIM).map(|i| (i as f32).sin()).collect();
    let b: Vec<f32> = (0..EMBED_DIM).map(|i| (i as f32).cos()).collect();
    c.bench_function("cosine_384", |bch| bch.iter(|| black_box(cosine_similarity(&a, &b))));
}

fn bench_flat_search(c: &mut Criterion) {
    let n = 2000u64;
    let mut index = FlatIndex::new(EMBED_DIM);
    for i in 0..n {
        let v: Vec<f32> = (0..EMBED_DIM).map(|j| ((i as usize * j) as f32).sin()).collect();
        index.add(i, &v).expect("add");
    }
    let q: Vec<f32> = (0..EMBED_DIM).map(|i| (i as f32 * 0.37).cos()).collect();
    c.bench_function("flat_search_2000x384_k5", |bch| bch.iter(|| black_box(index.search(&q, 5))));
}

fn bench_embed(c: &mut Criterion) {
    let embedder = HashingEmbedder::default();
    let texts: Vec<String> = (0..64).map(|i| format!("Grug hunt mammoth number {i} near big river.")).collect();
    let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
    c.bench_function("hashing_embed_one", |bch| bch.iter(|| black_box(embedder.embed("Grug hunt mammoth."))));
    c.bench_function("hashing_embed_batch_64", |bch| bch.iter(|| black_box(embedder.embed_batch(&refs))));
}

criterion_group!(benches, bench_cosine, bench_flat_search, bench_embed);
criterion_main!(benches);
