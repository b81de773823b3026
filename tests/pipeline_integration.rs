//! End-to-end pipeline tests through the public API: WAV in, DSL build,
//! live mutation, WAV out.

use audiopipe::builder::PipelineBuilder;
use audiopipe::defaults::{DEFAULT_SAMPLE_RATE, MIXER_FRAME_MS};
use audiopipe::live::{LivePipeline, PipelineRegistry, PipelineState};
use audiopipe::services::{MockSynthesizer, MockTranscriber, MockVoiceConverter, Services};
use std::path::Path;
use std::sync::Arc;

fn write_wav(path: &Path, rate: u32, samples: &[i16]) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).expect("create wav");
    for &s in samples {
        writer.write_sample(s).expect("write sample");
    }
    writer.finalize().expect("finalize");
}

fn read_wav(path: &Path) -> (u32, Vec<i16>) {
    let mut reader = hound::WavReader::open(path).expect("open wav");
    let rate = reader.spec().sample_rate;
    let samples = reader
        .samples::<i16>()
        .map(|s| s.expect("sample"))
        .collect();
    (rate, samples)
}

fn builder() -> PipelineBuilder {
    let services = Services::default()
        .with_synthesizer(Arc::new(MockSynthesizer::new(16000)))
        .with_transcriber(Arc::new(MockTranscriber::new("transcript")))
        .with_voice_converter(Arc::new(MockVoiceConverter));
    PipelineBuilder::new(services)
}

fn mixer_frame(rate: u32, sample: i16) -> Vec<u8> {
    let bytes = (rate as usize * MIXER_FRAME_MS as usize / 1000) * 2;
    (0..bytes / 2).flat_map(|_| sample.to_le_bytes()).collect()
}

#[test]
fn file_to_file_with_gain_halves_samples() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("in.wav");
    let output = dir.path().join("out.wav");
    write_wav(&input, 16000, &vec![1000i16; 8000]);

    let dsl = format!("file:{} | gain:0.5 | file:{}", input.display(), output.display());
    let built = builder().build(&dsl).expect("build");
    built.run.run();

    let (rate, samples) = read_wav(&output);
    assert_eq!(rate, 16000);
    assert_eq!(samples.len(), 8000);
    assert!(samples.iter().all(|&s| s == 500));
}

#[test]
fn explicit_resample_element_changes_output_rate() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("in.wav");
    let output = dir.path().join("out.wav");
    write_wav(&input, 32000, &(0..16000).map(|i| (i % 500) as i16).collect::<Vec<_>>());

    let dsl = format!(
        "file:{} | resample:32000:16000 | file:{}",
        input.display(),
        output.display()
    );
    let built = builder().build(&dsl).expect("build");
    built.run.run();

    let (rate, samples) = read_wav(&output);
    assert_eq!(rate, 16000);
    // Half a second of audio either way.
    assert!((samples.len() as i64 - 8000).abs() <= 2, "{}", samples.len());
}

#[test]
fn source_rate_is_bridged_to_processor_rate_automatically() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("in.wav");
    let output = dir.path().join("out.wav");
    // A 48 kHz file into an stt stage (which wants 16 kHz) and back out
    // through synthesis: the converters are inserted at the links.
    write_wav(&input, 48000, &vec![2000i16; 48000]);

    let dsl = format!("file:{} | stt:en | tts:v1 | file:{}", input.display(), output.display());
    let built = builder().build(&dsl).expect("build");
    built.run.run();

    let (rate, samples) = read_wav(&output);
    assert_eq!(rate, 16000);
    assert!(!samples.is_empty());
}

#[test]
fn record_element_taps_without_altering_primary_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("in.wav");
    let tap = dir.path().join("tap.wav");
    let output = dir.path().join("out.wav");
    write_wav(&input, 16000, &vec![400i16; 4000]);

    let dsl = format!(
        "file:{} | record:{} | gain:2 | file:{}",
        input.display(),
        tap.display(),
        output.display()
    );
    let built = builder().build(&dsl).expect("build");
    built.run.run();

    // The tap sees the pre-gain signal; the primary path sees the gain.
    let (_, tapped) = read_wav(&tap);
    assert_eq!(tapped.len(), 4000);
    assert!(tapped.iter().all(|&s| s == 400));
    let (_, out) = read_wav(&output);
    assert!(out.iter().all(|&s| s == 800));
}

#[test]
fn voice_conversion_round_trips_through_temp_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("in.wav");
    let output = dir.path().join("out.wav");
    write_wav(&input, 16000, &(0..4000).map(|i| (i % 321) as i16).collect::<Vec<_>>());

    let dsl = format!("file:{} | vc:target | file:{}", input.display(), output.display());
    let built = builder().build(&dsl).expect("build");
    built.run.run();

    // The identity mock returns the collected audio unchanged.
    let (_, out) = read_wav(&output);
    assert_eq!(out, (0..4000).map(|i| (i % 321) as i16).collect::<Vec<_>>());
}

#[test]
fn registry_drives_mutation_of_a_running_pipeline() {
    let b = builder();
    let registry = PipelineRegistry::new();
    let dsl = "mix:live | gain:0.5 | delay:0";
    let pipeline = LivePipeline::new("live-1", dsl, b.build(dsl).expect("build"));
    registry.register(pipeline.clone());

    let mixer = b.mixer("live", DEFAULT_SAMPLE_RATE);
    let input = mixer.add_input();
    let terminal = pipeline.run().terminal().clone();

    input
        .sender()
        .send(Some(mixer_frame(DEFAULT_SAMPLE_RATE, 100)))
        .expect("send");
    assert_eq!(terminal.pull(), Some(mixer_frame(DEFAULT_SAMPLE_RATE, 50)));

    // Patch the gain through the registry and observe the next frame.
    let got = registry.get("live-1").expect("get");
    let gain_id = got
        .detail()
        .stages
        .iter()
        .find(|s| s.kind == "gain")
        .map(|s| s.id.clone())
        .expect("gain stage");
    got.patch_stage(&gain_id, "factor", 2.0).expect("patch");

    input
        .sender()
        .send(Some(mixer_frame(DEFAULT_SAMPLE_RATE, 100)))
        .expect("send");
    assert_eq!(terminal.pull(), Some(mixer_frame(DEFAULT_SAMPLE_RATE, 200)));

    // Delete it and the signal passes through untouched.
    got.delete_stage(&gain_id).expect("delete");
    input
        .sender()
        .send(Some(mixer_frame(DEFAULT_SAMPLE_RATE, 100)))
        .expect("send");
    input.sender().send(None).expect("eof");
    assert_eq!(terminal.pull(), Some(mixer_frame(DEFAULT_SAMPLE_RATE, 100)));
    assert_eq!(terminal.pull(), None);

    registry.remove("live-1").expect("remove");
    assert_eq!(pipeline.state(), PipelineState::Stopped);
    assert!(registry.list().is_empty());
}

#[test]
fn started_pipeline_runs_to_completion_on_its_worker() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("in.wav");
    let output = dir.path().join("out.wav");
    write_wav(&input, 16000, &vec![250i16; 1600]);

    let b = builder();
    let dsl = format!("file:{} | file:{}", input.display(), output.display());
    let pipeline = LivePipeline::new("bg", &dsl, b.build(&dsl).expect("build"));
    let worker = pipeline.start();
    worker.join().expect("worker");
    assert_eq!(pipeline.state(), PipelineState::Stopped);

    let (_, out) = read_wav(&output);
    assert_eq!(out.len(), 1600);
}

#[test]
fn tee_merges_two_pipelines_through_a_shared_mixer() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("in.wav");
    let merged = dir.path().join("merged.wav");
    write_wav(&input, 16000, &vec![300i16; 3200]);

    let b = builder();
    // Producer copies its stream into the shared mixer; the consumer
    // pipeline drains the mixer into a file.
    let produce = format!("file:{} | tee:bus | delay:0", input.display());
    let consume = format!("mix:bus | file:{}", merged.display());
    let producer = b.build(&produce).expect("build producer");
    let consumer = b.build(&consume).expect("build consumer");

    producer.run.run();
    consumer.run.run();

    let (rate, out) = read_wav(&merged);
    assert_eq!(rate, DEFAULT_SAMPLE_RATE);
    assert!(out.iter().any(|&s| s == 300));
}
