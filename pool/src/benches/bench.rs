use criterion::criterion_main;

mod acquire;
mod write;

criterion_main!(acquire::benches, write::benches);
