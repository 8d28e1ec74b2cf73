use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use galileo::config::Config;
use galileo::gemtext::Translator;
use galileo::tmpl::DefaultTemplates;
use std::hint::black_box;

fn synthetic_gemtext(target_len: usize) -> String {
    let block = "# A heading\n\
                 Some prose about nothing in particular, long enough to matter.\n\
                 * first item\n\
                 * second item\n\
                 => /somewhere/else A link with a label\n\
                 => gemini://other.example/ An external link\n\
                 > a quoted line\n\
                 ```\n\
                 fn main() { println!(\"<escaped>\"); }\n\
                 ```\n\n";
    let mut doc = String::with_capacity(target_len + block.len());
    while doc.len() < target_len {
        doc.push_str(block);
    }
    doc
}

fn benchmark_translate(c: &mut Criterion) {
    let pc = Config::parse(
        r#"
[[proxy]]
host = "example.com"
proxy_addr = "example.com"
"#,
    )
    .unwrap()
    .proxies
    .remove(0);

    let doc = synthetic_gemtext(64 * 1024);

    let mut group = c.benchmark_group("gemtext");
    group.throughput(Throughput::Bytes(doc.len() as u64));
    group.bench_function("translate_64k", |b| {
        b.iter(|| {
            let mut tr = Translator::new(&pc, "example.com", "/script/", &DefaultTemplates);
            let mut out = Vec::with_capacity(doc.len() * 2);
            tr.feed(black_box(doc.as_bytes()), &mut out);
            tr.finish(&mut out);
            out
        })
    });
    group.finish();
}

criterion_group!(benches, benchmark_translate);
criterion_main!(benches);
