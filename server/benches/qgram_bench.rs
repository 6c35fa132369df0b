use criterion::{criterion_group, criterion_main, Criterion, black_box};
use rand::{distributions::Alphanumeric, rngs::StdRng, Rng, SeedableRng};

use wiki_server::completion;
use wiki_server::qgram::QGramIndex;

fn build_index(n: usize) -> QGramIndex {
    let mut rng = StdRng::seed_from_u64(7);
    let mut index = QGramIndex::new();
    for _ in 0..n {
        let words: Vec<String> = (0..rng.gen_range(1..4))
            .map(|_| {
                let len = rng.gen_range(3..10);
                (&mut rng).sample_iter(&Alphanumeric).take(len).map(char::from).collect()
            })
            .collect();
        let id = words.join(" ");
        index.add(&id, &id);
    }
    index.add("Albert Einstein", "Albert Einstein");
    index
}

fn bench_query(c: &mut Criterion) {
    let index = build_index(5000);
    c.bench_function("qgram_query_5000", |bch| {
        bch.iter(|| black_box(index.query(black_box("Albert Ein"))));
    });
}

fn bench_complete(c: &mut Criterion) {
    let index = build_index(5000);
    let context = "Yesterday I was reading about Albert Ein";
    c.bench_function("complete_5000", |bch| {
        bch.iter(|| black_box(completion::complete(&index, black_box(context))));
    });
}

criterion_group!(benches, bench_query, bench_complete);
criterion_main!(benches);
