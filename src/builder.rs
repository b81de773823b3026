//! Textual DSL to pipeline graph.
//!
//! A pipeline description is a `|`-separated list of elements, each
//! `kind:arg:arg...`. Building is two-pass: the whole description is
//! validated against the element table first, so a build error never
//! leaves partially-instantiated stages behind; only then are stages
//! created and wired with `connect` (which inserts format converters).

use crate::convert::Resample;
use crate::defaults::{
    BOUNDED_SEND_TIMEOUT, DEFAULT_SAMPLE_RATE, END_MARKER_TIMEOUT, MIXER_FRAME_MS, QUEUE_CAPACITY,
    STT_CHUNK_SECONDS, WORKER_JOIN_DEADLINE,
};
use crate::error::{PipelineError, Result};
use crate::format::AudioFormat;
use crate::io::{CliRawSink, CliTextSink, CliTextSource, FileRecorder, FileSource};
use crate::mixer::{AudioMixer, MixerSource};
use crate::services::Services;
use crate::stage::{Chunk, FeedItem, Produce, Stage, StageCx, StageRef, connect, drain, lock};
use crate::stages::{
    Control, DelayLine, EventToText, Gain, PitchShift, QueueSource, SttStage, TtsStage,
    VoiceConvertStage,
};
use crate::tee::{AudioTee, TeeStage, join_with_deadline};
use crossbeam_channel::{Sender, bounded};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, info, warn};

/// Payload category flowing between two elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Pcm,
    TextLines,
    EventBytes,
}

impl ValueKind {
    pub fn of(fmt: &AudioFormat) -> Self {
        if fmt.is_audio() {
            ValueKind::Pcm
        } else if fmt.encoding == crate::format::Encoding::Event {
            ValueKind::EventBytes
        } else {
            ValueKind::TextLines
        }
    }

    fn name(self) -> &'static str {
        match self {
            ValueKind::Pcm => "PCM",
            ValueKind::TextLines => "text",
            ValueKind::EventBytes => "events",
        }
    }
}

struct RawElement {
    kind: String,
    args: Vec<String>,
}

impl RawElement {
    /// Re-joins the args with `:` (file paths may contain colons).
    fn joined_args(&self) -> String {
        self.args.join(":")
    }
}

fn parse(dsl: &str) -> Result<Vec<RawElement>> {
    let mut elements = Vec::new();
    for part in dsl.split('|') {
        let part = part.trim();
        if part.is_empty() {
            return Err(PipelineError::build("empty element in pipeline"));
        }
        let mut pieces = part.split(':').map(str::to_string);
        let kind = match pieces.next() {
            Some(k) if !k.is_empty() => k,
            _ => return Err(PipelineError::build("empty element in pipeline")),
        };
        elements.push(RawElement {
            kind,
            args: pieces.collect(),
        });
    }
    if elements.is_empty() {
        return Err(PipelineError::build("empty pipeline"));
    }
    Ok(elements)
}

/// One instantiated user element: the stage, its metadata, and the
/// control handle if the element has a hot-updatable parameter.
pub struct BuiltElement {
    pub stage: StageRef,
    pub kind: String,
    pub params: Vec<(String, String)>,
    pub control: Option<Control>,
}

type Cleanup = Box<dyn FnOnce() + Send>;

/// Running pipeline handle: the stage list, the terminal element, and
/// the cleanup actions registered during construction.
pub struct PipelineRun {
    stages: Vec<StageRef>,
    terminal: StageRef,
    cleanups: Mutex<Vec<Cleanup>>,
    cancelled: AtomicBool,
}

impl PipelineRun {
    /// Drives the terminal element until exhaustion.
    pub fn run(&self) {
        drain(&self.terminal);
    }

    /// Cancels every stage, then runs the cleanup actions. Each action
    /// is independent; one failing does not stop the rest. Idempotent.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("cancelling pipeline run");
        for stage in &self.stages {
            stage.cancel();
        }
        let cleanups = std::mem::take(&mut *lock(&self.cleanups));
        for cleanup in cleanups {
            cleanup();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn terminal(&self) -> &StageRef {
        &self.terminal
    }
}

/// Result of a successful build.
pub struct BuiltPipeline {
    pub run: Arc<PipelineRun>,
    pub elements: Vec<BuiltElement>,
}

impl std::fmt::Debug for BuiltPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltPipeline")
            .field("elements", &self.elements.len())
            .finish_non_exhaustive()
    }
}

/// Translates pipeline descriptions into wired stage graphs.
///
/// Named mixers are memoized per builder: every `mix:NAME` and
/// `tee:NAME` across all pipelines built by this instance resolves to
/// the same [`AudioMixer`].
pub struct PipelineBuilder {
    services: Services,
    default_rate: u32,
    frame_ms: u32,
    mixers: Mutex<HashMap<String, Arc<AudioMixer>>>,
}

impl PipelineBuilder {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            default_rate: DEFAULT_SAMPLE_RATE,
            frame_ms: MIXER_FRAME_MS,
            mixers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_default_rate(mut self, rate: u32) -> Self {
        self.default_rate = rate;
        self
    }

    pub fn with_frame_ms(mut self, frame_ms: u32) -> Self {
        self.frame_ms = frame_ms;
        self
    }

    /// Returns the named mixer, creating it at `rate` on first use.
    pub fn mixer(&self, name: &str, rate: u32) -> Arc<AudioMixer> {
        lock(&self.mixers)
            .entry(name.to_string())
            .or_insert_with(|| AudioMixer::new(name, rate, self.frame_ms))
            .clone()
    }

    /// Builds a pipeline from its description.
    pub fn build(&self, dsl: &str) -> Result<BuiltPipeline> {
        let elements = parse(dsl)?;
        self.validate(&elements)?;
        debug!(elements = elements.len(), "pipeline validated");
        self.instantiate(&elements)
    }

    /// Builds a single mid-chain element for stage replacement.
    ///
    /// Only PCM-to-PCM processors are eligible: anything that changes
    /// the payload kind, owns side resources, or must sit at an end of
    /// the chain would break the neighbors it is spliced between.
    pub fn build_element(&self, dsl: &str, upstream: AudioFormat) -> Result<BuiltElement> {
        if dsl.contains('|') {
            return Err(PipelineError::build(
                "replacement must be a single element, not a pipeline",
            ));
        }
        let elements = parse(dsl)?;
        let el = &elements[0];
        match el.kind.as_str() {
            "gain" | "delay" | "pitch" | "resample" | "vc" => {}
            other => {
                return Err(PipelineError::build(format!(
                    "element '{other}' cannot be spliced into a running chain"
                )));
            }
        }
        if !upstream.is_audio() {
            return Err(PipelineError::bad_input(
                &el.kind,
                "PCM",
                ValueKind::of(&upstream).name(),
            ));
        }
        self.validate_params(el, false)?;
        let (built, _fmt, cleanups) = self.build_processor(el, upstream)?;
        debug_assert!(cleanups.is_empty());
        Ok(built)
    }

    /// Static validation of positions, value kinds and parameters.
    fn validate(&self, elements: &[RawElement]) -> Result<()> {
        let last = elements.len() - 1;
        let mut flow: Option<ValueKind> = None;
        for (i, el) in elements.iter().enumerate() {
            let first = i == 0;
            self.validate_params(el, first)?;
            let kind = el.kind.as_str();
            if first {
                flow = Some(match kind {
                    "file" => ValueKind::Pcm,
                    "cli" => ValueKind::TextLines,
                    "mix" => ValueKind::Pcm,
                    _ => {
                        return Err(PipelineError::bad_position(
                            kind,
                            "cannot start a pipeline",
                        ));
                    }
                });
                continue;
            }
            let incoming = flow.unwrap_or(ValueKind::Pcm);
            flow = Some(match kind {
                "file" => {
                    if i != last {
                        return Err(PipelineError::bad_position(
                            kind,
                            "as a sink must be the last element",
                        ));
                    }
                    require(kind, ValueKind::Pcm, incoming)?;
                    ValueKind::Pcm
                }
                "cli" => {
                    if i != last {
                        return Err(PipelineError::bad_position(
                            kind,
                            "as a sink must be the last element",
                        ));
                    }
                    match el.args[0].as_str() {
                        // Event upstream is bridged to text lines.
                        "text" => {
                            if incoming != ValueKind::TextLines
                                && incoming != ValueKind::EventBytes
                            {
                                return Err(PipelineError::bad_input(
                                    kind,
                                    "text or events",
                                    incoming.name(),
                                ));
                            }
                        }
                        "ndjson" => require(kind, ValueKind::EventBytes, incoming)?,
                        "raw" => {}
                        other => {
                            return Err(PipelineError::bad_param(
                                kind,
                                other,
                                "sink subtype must be text, ndjson or raw",
                            ));
                        }
                    }
                    incoming
                }
                "mix" => {
                    return Err(PipelineError::bad_position(kind, "must be the first element"));
                }
                "gain" | "delay" | "pitch" | "resample" | "vc" | "record" | "tee" => {
                    require(kind, ValueKind::Pcm, incoming)?;
                    ValueKind::Pcm
                }
                "stt" => {
                    require(kind, ValueKind::Pcm, incoming)?;
                    ValueKind::EventBytes
                }
                "tts" => {
                    if incoming == ValueKind::Pcm {
                        return Err(PipelineError::bad_input(
                            kind,
                            "text or events",
                            incoming.name(),
                        ));
                    }
                    ValueKind::Pcm
                }
                _ => return Err(PipelineError::unknown_element(kind)),
            });
        }
        Ok(())
    }

    fn validate_params(&self, el: &RawElement, first: bool) -> Result<()> {
        let kind = el.kind.as_str();
        match kind {
            "file" => {
                if el.args.is_empty() || el.args[0].is_empty() {
                    return Err(PipelineError::missing_param(kind, "file:PATH"));
                }
            }
            "cli" => {
                if el.args.len() != 1 {
                    return Err(PipelineError::missing_param(kind, "cli:SUBTYPE"));
                }
                if first && el.args[0] != "text" {
                    return Err(PipelineError::bad_param(
                        kind,
                        &el.args[0],
                        "source subtype must be text",
                    ));
                }
            }
            "mix" => {
                if el.args.is_empty() || el.args[0].is_empty() {
                    return Err(PipelineError::missing_param(kind, "mix:MIXER[:RATE]"));
                }
                if el.args.len() > 1 {
                    parse_num::<u32>(kind, "rate", &el.args[1], |r| *r > 0)?;
                }
            }
            "gain" => {
                let arg = one_arg(el, "gain:FACTOR")?;
                parse_num::<f32>(kind, "factor", arg, |f| *f >= 0.0 && f.is_finite())?;
            }
            "delay" => {
                let arg = one_arg(el, "delay:MS")?;
                parse_num::<u64>(kind, "ms", arg, |_| true)?;
            }
            "pitch" => {
                let arg = one_arg(el, "pitch:SEMITONES")?;
                parse_num::<f64>(kind, "semitones", arg, |s| s.is_finite())?;
            }
            "resample" => {
                if el.args.len() != 2 {
                    return Err(PipelineError::missing_param(kind, "resample:SRC:DST"));
                }
                parse_num::<u32>(kind, "src", &el.args[0], |r| *r > 0)?;
                parse_num::<u32>(kind, "dst", &el.args[1], |r| *r > 0)?;
            }
            "stt" => {
                if el.args.is_empty() || el.args[0].is_empty() {
                    return Err(PipelineError::missing_param(
                        kind,
                        "stt:LANG[:CHUNK_S[:MODEL]]",
                    ));
                }
                if el.args.len() > 1 {
                    parse_num::<f64>(kind, "chunk_seconds", &el.args[1], |s| *s > 0.0)?;
                }
                if self.services.transcriber.is_none() {
                    return Err(PipelineError::MissingService {
                        service: "transcription".to_string(),
                        element: kind.to_string(),
                    });
                }
            }
            "tts" => {
                let _ = one_arg(el, "tts:VOICE")?;
                if self.services.synthesizer.is_none() {
                    return Err(PipelineError::MissingService {
                        service: "synthesis".to_string(),
                        element: kind.to_string(),
                    });
                }
            }
            "vc" => {
                let _ = one_arg(el, "vc:VOICE")?;
                if self.services.voice_converter.is_none() {
                    return Err(PipelineError::MissingService {
                        service: "voice conversion".to_string(),
                        element: kind.to_string(),
                    });
                }
            }
            "record" => {
                if el.args.is_empty() || el.args[0].is_empty() {
                    return Err(PipelineError::missing_param(kind, "record:FILE[:RATE]"));
                }
                if el.args.len() > 1
                    && let Some(rate) = el.args.last()
                    && rate.chars().all(|c| c.is_ascii_digit())
                {
                    parse_num::<u32>(kind, "rate", rate, |r| *r > 0)?;
                }
            }
            "tee" => {
                if el.args.len() != 1 || el.args[0].is_empty() {
                    return Err(PipelineError::missing_param(kind, "tee:MIXER"));
                }
            }
            _ => return Err(PipelineError::unknown_element(kind)),
        }
        Ok(())
    }

    fn instantiate(&self, elements: &[RawElement]) -> Result<BuiltPipeline> {
        let last = elements.len() - 1;
        let mut built: Vec<BuiltElement> = Vec::with_capacity(elements.len());
        let mut stages: Vec<StageRef> = Vec::new();
        let mut cleanups: Vec<Cleanup> = Vec::new();
        let mut prev: Option<StageRef> = None;
        let mut flow = AudioFormat::pcm16(self.default_rate);

        for (i, el) in elements.iter().enumerate() {
            let (element, new_flow, mut extra) = if i == 0 {
                self.build_source(el)?
            } else {
                let (element, new_flow, extra) = match el.kind.as_str() {
                    "file" if i == last => {
                        let path = el.joined_args();
                        let recorder = FileRecorder::create(&path, flow)?;
                        (
                            BuiltElement {
                                stage: Stage::new("file", Box::new(recorder)),
                                kind: "file".to_string(),
                                params: vec![("path".to_string(), path)],
                                control: None,
                            },
                            flow,
                            Vec::new(),
                        )
                    }
                    "cli" => self.build_cli_sink(el, flow)?,
                    _ => self.build_processor(el, flow)?,
                };
                (element, new_flow, extra)
            };

            if let Some(up) = prev.take() {
                let up = if needs_text_bridge(&up, &element.stage) {
                    let adapter = Stage::new("events", Box::new(EventToText::new()));
                    connect(&up, &adapter);
                    stages.push(adapter.clone());
                    adapter
                } else {
                    up
                };
                connect(&up, &element.stage);
            }
            flow = new_flow;
            prev = Some(element.stage.clone());
            stages.push(element.stage.clone());
            built.push(element);
            cleanups.append(&mut extra);
        }

        let terminal = match prev {
            Some(stage) => stage,
            None => return Err(PipelineError::build("empty pipeline")),
        };
        info!(stages = stages.len(), "pipeline built");
        Ok(BuiltPipeline {
            run: Arc::new(PipelineRun {
                stages,
                terminal,
                cleanups: Mutex::new(cleanups),
                cancelled: AtomicBool::new(false),
            }),
            elements: built,
        })
    }

    fn build_source(&self, el: &RawElement) -> Result<(BuiltElement, AudioFormat, Vec<Cleanup>)> {
        match el.kind.as_str() {
            "file" => {
                let path = el.joined_args();
                let source = FileSource::open(&path)?;
                let fmt = source.format();
                Ok((
                    BuiltElement {
                        stage: Stage::new("file", Box::new(source)),
                        kind: "file".to_string(),
                        params: vec![("path".to_string(), path)],
                        control: None,
                    },
                    fmt,
                    Vec::new(),
                ))
            }
            "cli" => Ok((
                BuiltElement {
                    stage: Stage::new("cli", Box::new(CliTextSource::stdin())),
                    kind: "cli".to_string(),
                    params: vec![("subtype".to_string(), "text".to_string())],
                    control: None,
                },
                AudioFormat::text(),
                Vec::new(),
            )),
            "mix" => {
                let name = &el.args[0];
                let rate = match el.args.get(1) {
                    Some(r) => parse_num::<u32>("mix", "rate", r, |r| *r > 0)?,
                    None => self.default_rate,
                };
                let mixer = self.mixer(name, rate);
                if el.args.len() > 1 && mixer.sample_rate() != rate {
                    return Err(PipelineError::build(format!(
                        "mixer '{name}' already exists at {} Hz",
                        mixer.sample_rate()
                    )));
                }
                let fmt = mixer.output_format();
                Ok((
                    BuiltElement {
                        stage: Stage::new("mix", Box::new(MixerSource::new(mixer))),
                        kind: "mix".to_string(),
                        params: vec![
                            ("mixer".to_string(), name.clone()),
                            ("rate".to_string(), fmt.sample_rate.to_string()),
                        ],
                        control: None,
                    },
                    fmt,
                    Vec::new(),
                ))
            }
            other => Err(PipelineError::bad_position(other, "cannot start a pipeline")),
        }
    }

    fn build_cli_sink(
        &self,
        el: &RawElement,
        flow: AudioFormat,
    ) -> Result<(BuiltElement, AudioFormat, Vec<Cleanup>)> {
        let subtype = el.args[0].clone();
        // ndjson writes the event bytes untouched; only `text` re-frames
        // lines (and gets the event bridge upstream when needed).
        let stage = match subtype.as_str() {
            "text" => Stage::new("cli", Box::new(CliTextSink::stdout())),
            _ => Stage::new("cli", Box::new(CliRawSink::stdout())),
        };
        Ok((
            BuiltElement {
                stage,
                kind: "cli".to_string(),
                params: vec![("subtype".to_string(), subtype)],
                control: None,
            },
            flow,
            Vec::new(),
        ))
    }

    fn build_processor(
        &self,
        el: &RawElement,
        flow: AudioFormat,
    ) -> Result<(BuiltElement, AudioFormat, Vec<Cleanup>)> {
        let kind = el.kind.as_str();
        match kind {
            "gain" => {
                let factor = parse_num::<f32>(kind, "factor", &el.args[0], |_| true)?;
                let (gain, control) = Gain::new(flow, factor);
                Ok((
                    BuiltElement {
                        stage: Stage::new("gain", Box::new(gain)),
                        kind: "gain".to_string(),
                        params: vec![("factor".to_string(), factor.to_string())],
                        control: Some(Control::Gain(control)),
                    },
                    flow,
                    Vec::new(),
                ))
            }
            "delay" => {
                let ms = parse_num::<u64>(kind, "ms", &el.args[0], |_| true)?;
                let (delay, control) = DelayLine::new(flow, ms);
                Ok((
                    BuiltElement {
                        stage: Stage::new("delay", Box::new(delay)),
                        kind: "delay".to_string(),
                        params: vec![("ms".to_string(), ms.to_string())],
                        control: Some(Control::Delay(control)),
                    },
                    flow,
                    Vec::new(),
                ))
            }
            "pitch" => {
                let semitones = parse_num::<f64>(kind, "semitones", &el.args[0], |_| true)?;
                Ok((
                    BuiltElement {
                        stage: Stage::new("pitch", Box::new(PitchShift::new(flow, semitones))),
                        kind: "pitch".to_string(),
                        params: vec![("semitones".to_string(), semitones.to_string())],
                        control: None,
                    },
                    flow,
                    Vec::new(),
                ))
            }
            "resample" => {
                let src = parse_num::<u32>(kind, "src", &el.args[0], |_| true)?;
                let dst = parse_num::<u32>(kind, "dst", &el.args[1], |_| true)?;
                let out = AudioFormat::pcm16(dst);
                let stage = Stage::new(
                    "resample",
                    Box::new(DeclaredResample {
                        inner: Resample::new(src, dst),
                        input: AudioFormat::pcm16(src),
                        output: out,
                    }),
                );
                Ok((
                    BuiltElement {
                        stage,
                        kind: "resample".to_string(),
                        params: vec![
                            ("src".to_string(), src.to_string()),
                            ("dst".to_string(), dst.to_string()),
                        ],
                        control: None,
                    },
                    out,
                    Vec::new(),
                ))
            }
            "stt" => {
                let transcriber = self.services.transcriber.clone().ok_or_else(|| {
                    PipelineError::MissingService {
                        service: "transcription".to_string(),
                        element: kind.to_string(),
                    }
                })?;
                let lang = el.args[0].clone();
                let chunk_seconds = match el.args.get(1) {
                    Some(s) => parse_num::<f64>(kind, "chunk_seconds", s, |_| true)?,
                    None => STT_CHUNK_SECONDS,
                };
                let mut params = vec![
                    ("lang".to_string(), lang),
                    ("chunk_seconds".to_string(), chunk_seconds.to_string()),
                ];
                if let Some(model) = el.args.get(2) {
                    params.push(("model".to_string(), model.clone()));
                }
                Ok((
                    BuiltElement {
                        stage: Stage::new(
                            "stt",
                            Box::new(SttStage::new(transcriber, chunk_seconds)),
                        ),
                        kind: "stt".to_string(),
                        params,
                        control: None,
                    },
                    AudioFormat::event(),
                    Vec::new(),
                ))
            }
            "tts" => {
                let synth = self.services.synthesizer.clone().ok_or_else(|| {
                    PipelineError::MissingService {
                        service: "synthesis".to_string(),
                        element: kind.to_string(),
                    }
                })?;
                let voice = el.args[0].clone();
                let out = AudioFormat::pcm16(synth.native_rate());
                Ok((
                    BuiltElement {
                        stage: Stage::new("tts", Box::new(TtsStage::new(synth, voice.clone()))),
                        kind: "tts".to_string(),
                        params: vec![("voice".to_string(), voice)],
                        control: None,
                    },
                    out,
                    Vec::new(),
                ))
            }
            "vc" => {
                let converter = self.services.voice_converter.clone().ok_or_else(|| {
                    PipelineError::MissingService {
                        service: "voice conversion".to_string(),
                        element: kind.to_string(),
                    }
                })?;
                let voice = el.args[0].clone();
                Ok((
                    BuiltElement {
                        stage: Stage::new(
                            "vc",
                            Box::new(VoiceConvertStage::new(
                                converter,
                                voice.clone(),
                                flow.sample_rate,
                            )),
                        ),
                        kind: "vc".to_string(),
                        params: vec![("voice".to_string(), voice)],
                        control: None,
                    },
                    flow,
                    Vec::new(),
                ))
            }
            "record" => self.build_record(el, flow),
            "tee" => self.build_tee(el, flow),
            other => Err(PipelineError::unknown_element(other)),
        }
    }

    /// `record:FILE[:RATE]`: a tee whose only side-chain writes a WAV.
    fn build_record(
        &self,
        el: &RawElement,
        flow: AudioFormat,
    ) -> Result<(BuiltElement, AudioFormat, Vec<Cleanup>)> {
        let (path, rate) = match el.args.last() {
            Some(last) if el.args.len() > 1 && last.chars().all(|c| c.is_ascii_digit()) => {
                let rate = parse_num::<u32>("record", "rate", last, |_| true)?;
                (el.args[..el.args.len() - 1].join(":"), rate)
            }
            _ => (el.joined_args(), flow.sample_rate),
        };
        let tee = AudioTee::new(flow);
        let recorder = FileRecorder::create(&path, AudioFormat::pcm16(rate))?;
        let sink = Stage::new("file", Box::new(recorder));
        tee.add_sidechain(sink);
        Ok((
            BuiltElement {
                stage: Stage::new("record", Box::new(TeeStage::new(tee))),
                kind: "record".to_string(),
                params: vec![
                    ("path".to_string(), path),
                    ("rate".to_string(), rate.to_string()),
                ],
                control: None,
            },
            flow,
            Vec::new(),
        ))
    }

    /// `tee:MIXER`: duplicates the stream into the named mixer's input.
    ///
    /// A rate mismatch spawns a bridge worker resampling the copy on
    /// its way into the mixer; the primary path is untouched either way.
    fn build_tee(
        &self,
        el: &RawElement,
        flow: AudioFormat,
    ) -> Result<(BuiltElement, AudioFormat, Vec<Cleanup>)> {
        let name = &el.args[0];
        let mixer = self.mixer(name, self.default_rate);
        let tee = AudioTee::new(flow);
        let input = mixer.add_input();
        let mut cleanups: Vec<Cleanup> = Vec::new();

        if flow.sample_rate == mixer.sample_rate() {
            tee.add_feed(input.sender());
        } else {
            debug!(
                from = flow.sample_rate,
                to = mixer.sample_rate(),
                mixer = %name,
                "tee rate mismatch, bridging"
            );
            let (btx, brx) = bounded(QUEUE_CAPACITY);
            tee.add_feed(btx);
            let source = Stage::new("feed", Box::new(QueueSource::new(brx, Some(flow))));
            let pump = Stage::new(
                "mixfeed",
                Box::new(MixerFeed {
                    format: mixer.output_format(),
                    tx: input.sender(),
                }),
            );
            connect(&source, &pump);
            let worker = {
                let pump = pump.clone();
                thread::spawn(move || drain(&pump))
            };
            cleanups.push(Box::new(move || {
                pump.cancel();
                join_with_deadline(vec![worker], WORKER_JOIN_DEADLINE);
            }));
        }

        Ok((
            BuiltElement {
                stage: Stage::new("tee", Box::new(TeeStage::new(tee))),
                kind: "tee".to_string(),
                params: vec![("mixer".to_string(), name.clone())],
                control: None,
            },
            flow,
            cleanups,
        ))
    }
}

/// True when the downstream wants text and the upstream yields events.
fn needs_text_bridge(up: &StageRef, down: &StageRef) -> bool {
    matches!(
        (up.output_format(), down.input_format()),
        (Some(src), Some(dst))
            if src.encoding == crate::format::Encoding::Event
                && dst.encoding == crate::format::Encoding::Text
    )
}

/// Bridge terminal pumping resampled tee copies into a mixer queue.
struct MixerFeed {
    format: AudioFormat,
    tx: Sender<FeedItem>,
}

impl Produce for MixerFeed {
    fn input_format(&self) -> Option<AudioFormat> {
        Some(self.format)
    }

    fn produce(&mut self, cx: &StageCx<'_>) -> Option<Chunk> {
        match cx.pull() {
            Some(chunk) => {
                if self
                    .tx
                    .send_timeout(Some(chunk.clone()), BOUNDED_SEND_TIMEOUT)
                    .is_err()
                {
                    warn!(stage = cx.stage_id(), "mixer queue stalled, dropping chunk");
                }
                Some(chunk)
            }
            None => {
                let _ = self.tx.send_timeout(None, END_MARKER_TIMEOUT);
                None
            }
        }
    }

    fn on_cancel(&mut self) {
        let _ = self.tx.send_timeout(None, END_MARKER_TIMEOUT);
    }
}

struct DeclaredResample {
    inner: Resample,
    input: AudioFormat,
    output: AudioFormat,
}

impl Produce for DeclaredResample {
    fn input_format(&self) -> Option<AudioFormat> {
        Some(self.input)
    }

    fn output_format(&self) -> Option<AudioFormat> {
        Some(self.output)
    }

    fn produce(&mut self, cx: &StageCx<'_>) -> Option<Chunk> {
        self.inner.produce(cx)
    }
}

fn require(kind: &str, wants: ValueKind, got: ValueKind) -> Result<()> {
    if wants == got {
        Ok(())
    } else {
        Err(PipelineError::bad_input(kind, wants.name(), got.name()))
    }
}

fn one_arg<'a>(el: &'a RawElement, usage: &str) -> Result<&'a str> {
    match el.args.first() {
        Some(arg) if !arg.is_empty() && el.args.len() == 1 => Ok(arg),
        _ => Err(PipelineError::missing_param(&el.kind, usage)),
    }
}

fn parse_num<T: std::str::FromStr>(
    kind: &str,
    param: &str,
    value: &str,
    valid: impl Fn(&T) -> bool,
) -> Result<T> {
    match value.parse::<T>() {
        Ok(v) if valid(&v) => Ok(v),
        _ => Err(PipelineError::bad_param(kind, param, value)),
    }
}
