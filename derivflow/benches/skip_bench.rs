//! Benchmarks for skip decisions and ledger aggregation.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use derivflow::core::{AnalysisStatus, NodeKind, SubjectPath};
use derivflow::ledger::AnalysisLedger;
use derivflow::skip::{should_skip, ParamFingerprint};
use derivflow::store::ResumeEntry;

fn skip_benchmark(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("sub-01_out.nii");
    std::fs::write(&output, b"x").unwrap();
    let subject = SubjectPath::new(dir.path().join("sub-01_T1w.nii")).unwrap();
    let entry = ResumeEntry::success([output.to_string_lossy().into_owned()]);
    let fingerprint = ParamFingerprint::Default;

    c.bench_function("should_skip_hit", |b| {
        b.iter(|| should_skip(black_box(&subject), true, Some(black_box(&entry)), &fingerprint));
    });
    c.bench_function("should_skip_disabled", |b| {
        b.iter(|| should_skip(black_box(&subject), false, Some(black_box(&entry)), &fingerprint));
    });
}

fn aggregate_benchmark(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let subjects: Vec<_> = (0..500).map(|i| dir.path().join(format!("sub-{i:03}_T1w.nii"))).collect();
    let mut ledger =
        AnalysisLedger::create(&subjects, Vec::<(std::path::PathBuf, Vec<String>)>::new(), NodeKind::from("alignment"))
            .unwrap();
    for subject in &subjects {
        ledger.set_status(subject, AnalysisStatus::Error).unwrap();
    }

    c.bench_function("aggregate_status_500", |b| {
        b.iter(|| black_box(&ledger).aggregate_status());
    });
}

criterion_group!(benches, skip_benchmark, aggregate_benchmark);
criterion_main!(benches);
