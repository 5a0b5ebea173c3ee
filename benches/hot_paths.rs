use criterion::{black_box, criterion_group, criterion_main, Criterion};
use cprobe::metric::{Labels, TimeSeries};
use cprobe::plugin::prometheus::parse_text;
use cprobe::relabel::{finalize, Action, ParsedRelabelConfigs, RelabelConfig};
use cprobe::sink::remote::prompb::encode_write_request;

fn target_labels(i: usize) -> Labels {
    Labels::from_pairs([
        ("__address__".to_string(), format!("10.0.{}.{}:9100", i / 256, i % 256)),
        ("__meta_consul_service".to_string(), "node-exporter".to_string()),
        ("__meta_consul_dc".to_string(), "eu-west".to_string()),
        ("job".to_string(), "node".to_string()),
        ("instance".to_string(), format!("host-{i}")),
    ])
}

fn rules() -> ParsedRelabelConfigs {
    let configs = vec![
        RelabelConfig {
            source_labels: vec!["__meta_consul_service".to_string()],
            regex: "node-.*".to_string(),
            action: Action::Keep,
            ..RelabelConfig::default()
        },
        RelabelConfig {
            source_labels: vec!["__address__".to_string()],
            regex: "([^:]+):\\d+".to_string(),
            target_label: "host".to_string(),
            ..RelabelConfig::default()
        },
        RelabelConfig {
            regex: "__meta_consul_(.+)".to_string(),
            replacement: "consul_$1".to_string(),
            action: Action::Labelmap,
            ..RelabelConfig::default()
        },
    ];
    ParsedRelabelConfigs::parse(&configs).expect("parse rules")
}

fn batch(n: usize) -> Vec<TimeSeries> {
    (0..n)
        .map(|i| {
            let mut labels = Labels::from_pairs([
                ("__name__".to_string(), format!("node_cpu_seconds_total_{}", i % 16)),
                ("cpu".to_string(), (i % 8).to_string()),
                ("mode".to_string(), "idle".to_string()),
                ("instance".to_string(), format!("host-{}", i % 64)),
                ("job".to_string(), "node".to_string()),
            ]);
            labels.sort();
            TimeSeries::new(labels, i as f64, 1_700_000_000_000 + i as i64)
        })
        .collect()
}

fn exposition(lines: usize) -> String {
    let mut body = String::from("# HELP node_load1 1m load average.\n# TYPE node_load1 gauge\n");
    for i in 0..lines {
        body.push_str(&format!(
            "node_network_receive_bytes_total{{device=\"eth{}\",host=\"h\\\"{}\"}} {}\n",
            i % 4,
            i,
            i * 1024
        ));
    }
    body
}

fn bench_relabel(c: &mut Criterion) {
    let rules = rules();
    let targets: Vec<Labels> = (0..256).map(target_labels).collect();

    c.bench_function("relabel/apply_256_targets", |b| {
        b.iter(|| {
            for t in &targets {
                let mut labels = t.clone();
                rules.apply(black_box(&mut labels));
                black_box(labels.len());
            }
        })
    });

    let series = batch(256);
    c.bench_function("relabel/finalize_256_series", |b| {
        b.iter(|| {
            for ts in &series {
                let mut labels = ts.labels.clone();
                finalize(black_box(&mut labels));
                black_box(labels.len());
            }
        })
    });
}

fn bench_encode(c: &mut Criterion) {
    let series = batch(1_000);

    c.bench_function("prompb/encode_1000_series", |b| {
        b.iter(|| {
            let body = encode_write_request(black_box(series.clone())).expect("encode");
            black_box(body.len())
        })
    });
}

fn bench_parse_text(c: &mut Criterion) {
    let body = exposition(500);

    c.bench_function("exposition/parse_500_lines", |b| {
        b.iter(|| parse_text(black_box(&body)).expect("parse").len())
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_relabel(c);
    bench_encode(c);
    bench_parse_text(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
