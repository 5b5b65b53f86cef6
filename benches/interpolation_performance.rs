use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

use swarmhub::flows::interpolate::{render, resolve_path};

fn bench_interpolation(c: &mut Criterion) {
    let root = json!({
        "trigger": {
            "message": {
                "body": "hello world, this is a reasonably sized message body",
                "senderName": "Alice",
                "chatId": "chat-123456",
            },
        },
        "vars": {"count": 42, "nested": {"deep": {"value": "x"}}},
        "chunks": (0..20).map(|i| json!({"text": format!("chunk {}", i)})).collect::<Vec<_>>(),
    });

    c.bench_function("render_simple_template", |b| {
        let mut unresolved = Vec::new();
        b.iter(|| {
            unresolved.clear();
            black_box(render(
                "hi {{trigger.message.senderName}}, re: {{trigger.message.body}}",
                &root,
                &mut unresolved,
            ))
        })
    });

    c.bench_function("render_with_fallback", |b| {
        let mut unresolved = Vec::new();
        b.iter(|| {
            unresolved.clear();
            black_box(render(
                "{{vars.missing || vars.nested.deep.value}}",
                &root,
                &mut unresolved,
            ))
        })
    });

    c.bench_function("resolve_indexed_path", |b| {
        b.iter(|| black_box(resolve_path(&root, "chunks.19.text")))
    });
}

criterion_group!(benches, bench_interpolation);
criterion_main!(benches);
