use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dumpshift::convert::{DumpRewriter, RewriteOptions};
use dumpshift::parser::{StatementReader, TruncationPolicy, SMALL_BUFFER_SIZE};
use dumpshift::protect::ProtectionRules;
use std::hint::black_box;
use std::io::BufReader;
use std::sync::Arc;

fn generate_insert_dump(num_statements: usize) -> Vec<u8> {
    let mut data = Vec::new();

    data.extend_from_slice(
        b"CREATE TABLE public.users (id integer NOT NULL, name text, email text);\n",
    );

    for i in 0..num_statements {
        let stmt = format!(
            "INSERT INTO public.users VALUES ({}, 'User {}; the second', 'user{}@example.com');\n",
            i, i, i
        );
        data.extend_from_slice(stmt.as_bytes());
    }

    data
}

fn generate_copy_dump(tables: usize, rows_per_table: usize) -> Vec<u8> {
    let mut data = Vec::new();

    data.extend_from_slice(
        b"CREATE FUNCTION public.touch() RETURNS trigger AS $$\nBEGIN\n  NEW.updated := now();\n  RETURN NEW;\nEND;\n$$ LANGUAGE plpgsql;\n",
    );

    for t in 0..tables {
        let table_name = format!("public.table_{}", t);
        data.extend_from_slice(
            format!(
                "CREATE TABLE {} (id integer NOT NULL, name text, data text);\n",
                table_name
            )
            .as_bytes(),
        );
        data.extend_from_slice(
            format!("COPY {} (id, name, data) FROM stdin;\n", table_name).as_bytes(),
        );
        for r in 0..rows_per_table {
            let row = format!(
                "{}\tName {}\tLorem ipsum 'dolor' sit amet,\\tconsectetur\\nadipiscing\n",
                r, r
            );
            data.extend_from_slice(row.as_bytes());
        }
        data.extend_from_slice(b"\\.\n");
    }

    data
}

fn bench_tokenizer_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("tokenizer_throughput");

    for size in [1000, 10000, 50000] {
        let data = generate_insert_dump(size);

        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("statements", format!("{}_stmts", size)),
            &data,
            |b, data| {
                b.iter(|| {
                    let reader = BufReader::with_capacity(SMALL_BUFFER_SIZE, &data[..]);
                    let count = StatementReader::new(reader, TruncationPolicy::Repair)
                        .filter_map(|item| item.ok())
                        .count();
                    black_box(count)
                })
            },
        );
    }

    group.finish();
}

fn bench_copy_rows(c: &mut Criterion) {
    let mut group = c.benchmark_group("tokenizer_copy_rows");

    for (tables, rows) in [(10, 1000), (5, 10000)] {
        let data = generate_copy_dump(tables, rows);

        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("items", format!("{}x{}", tables, rows)),
            &data,
            |b, data| {
                b.iter(|| {
                    let count = StatementReader::new(&data[..], TruncationPolicy::Repair)
                        .filter_map(|item| item.ok())
                        .count();
                    black_box(count)
                })
            },
        );
    }

    group.finish();
}

fn bench_copy_rewrite(c: &mut Criterion) {
    let mut group = c.benchmark_group("copy_rewrite");
    let data = generate_copy_dump(5, 10000);
    let rules = Arc::new(ProtectionRules::for_source(
        &Default::default(),
        Some("ffc-doc-statement-data-test"),
    ));

    group.throughput(Throughput::Bytes(data.len() as u64));
    for width in [100, 500, 2000] {
        group.bench_with_input(BenchmarkId::new("insert_width", width), &width, |b, &width| {
            b.iter(|| {
                let options = RewriteOptions {
                    insert_batch_width: width,
                    ..Default::default()
                };
                let mut rewriter = DumpRewriter::new(options, Arc::clone(&rules));
                let mut out = Vec::new();
                let mut bytes = 0usize;
                for item in StatementReader::new(&data[..], TruncationPolicy::Repair).flatten() {
                    rewriter.process(item, &mut out);
                    bytes += out.drain(..).map(|s| s.len()).sum::<usize>();
                }
                let stats = rewriter.finish(0, data.len() as u64, &mut out);
                black_box((bytes, stats.inserts_generated))
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_tokenizer_throughput,
    bench_copy_rows,
    bench_copy_rewrite
);
criterion_main!(benches);
