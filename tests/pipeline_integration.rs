//! End-to-end pipeline scenarios: graph assembly, lifecycle fan-out, event
//! aggregation, flush staleness, codec retry, and teardown under load.

use avflow::prelude::*;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

// ============================================================================
// Harness
// ============================================================================

/// Install a per-process subscriber so `RUST_LOG=debug cargo test` shows the
/// lifecycle trace. Safe to call from every test.
fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Engine stand-in: records events and lets tests wait for one.
struct Engine {
    events: Mutex<Vec<(String, EventType)>>,
    cond: Condvar,
}

impl Engine {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            cond: Condvar::new(),
        })
    }

    fn wait_for(&self, wanted: EventType, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock().unwrap();
        loop {
            if events.iter().any(|(_, t)| *t == wanted) {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _) = self.cond.wait_timeout(events, remaining).unwrap();
            events = guard;
        }
    }

    fn count_of(&self, wanted: EventType) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, t)| *t == wanted)
            .count()
    }

    fn sources_of(&self, wanted: EventType) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, t)| *t == wanted)
            .map(|(s, _)| s.clone())
            .collect()
    }
}

impl EventReceiver for Engine {
    fn on_event(&self, event: Event) {
        self.events
            .lock()
            .unwrap()
            .push((event.src_filter, event.event_type));
        self.cond.notify_all();
    }
}

impl FilterCallback for Engine {
    fn on_callback(&self, _: &str, _: CallbackCommand, _: StreamType) {}
}

/// Scriptable plugin driven entirely from tests.
#[derive(Default)]
struct ScriptedPlugin {
    channel: Mutex<Option<CodecDataChannel>>,
    lifecycle: Mutex<Vec<&'static str>>,
    reject_inputs: AtomicU32,
    inputs_accepted: AtomicUsize,
    echo: bool,
    fail_start: bool,
}

impl ScriptedPlugin {
    fn mark(&self, what: &'static str) {
        self.lifecycle.lock().unwrap().push(what);
    }

    fn saw(&self, what: &str) -> bool {
        self.lifecycle.lock().unwrap().iter().any(|w| *w == what)
    }
}

impl CodecPlugin for ScriptedPlugin {
    fn init(&self) -> Result<()> {
        self.mark("init");
        Ok(())
    }
    fn deinit(&self) -> Result<()> {
        self.mark("deinit");
        Ok(())
    }
    fn prepare(&self) -> Result<()> {
        self.mark("prepare");
        Ok(())
    }
    fn reset(&self) -> Result<()> {
        self.mark("reset");
        Ok(())
    }
    fn start(&self) -> Result<()> {
        self.mark("start");
        if self.fail_start {
            return Err(Error::Plugin("no codec instance available".into()));
        }
        Ok(())
    }
    fn stop(&self) -> Result<()> {
        self.mark("stop");
        Ok(())
    }
    fn flush(&self) -> Result<()> {
        self.mark("flush");
        Ok(())
    }

    fn set_parameter(&self, _tag: ParamTag, _value: Value) -> Result<()> {
        Ok(())
    }
    fn get_parameter(&self, tag: ParamTag) -> Result<Value> {
        match tag {
            ParamTag::OutputBufferCount => Ok(Value::UInt(4)),
            ParamTag::OutputBufferSize => Ok(Value::UInt(4096)),
            _ => Err(Error::InvalidParameter(format!("{tag:?}"))),
        }
    }

    fn queue_input_buffer(
        &self,
        buffer: FrameBuffer,
        _timeout: Duration,
    ) -> std::result::Result<(), (FrameBuffer, Error)> {
        if self.reject_inputs.load(Ordering::SeqCst) > 0 {
            self.reject_inputs.fetch_sub(1, Ordering::SeqCst);
            return Err((buffer, Error::Again));
        }
        self.inputs_accepted.fetch_add(1, Ordering::SeqCst);
        if self.echo {
            if let Some(channel) = self.channel.lock().unwrap().as_ref() {
                let _ = channel.output_done.send(buffer);
            }
        }
        Ok(())
    }

    fn queue_output_buffer(
        &self,
        _buffer: FrameBuffer,
        _timeout: Duration,
    ) -> std::result::Result<(), (FrameBuffer, Error)> {
        Ok(())
    }

    fn set_data_channel(&self, channel: CodecDataChannel) {
        *self.channel.lock().unwrap() = Some(channel);
    }
}

/// Head-filter behavior that captures the port of whatever gets linked
/// downstream, so tests can push buffers into the graph.
#[derive(Default)]
struct SourceTap {
    port: Arc<Mutex<Option<Arc<dyn InputPort>>>>,
}

impl FilterBehavior for SourceTap {
    fn bind_output_port(&mut self, _stream: StreamType, port: Arc<dyn InputPort>) {
        *self.port.lock().unwrap() = Some(port);
    }
    fn unbind_output_port(&mut self, _stream: StreamType) {
        *self.port.lock().unwrap() = None;
    }
}

struct Noop;
impl FilterBehavior for Noop {}

fn buffer(byte: u8) -> FrameBuffer {
    FrameBuffer::new(vec![byte], BufferMeta::default())
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn two_filter_pipeline_aggregates_ready() {
    init_logging();
    let engine = Engine::new();
    let pipeline = Pipeline::new("playback");
    pipeline
        .init(Arc::clone(&engine) as Arc<dyn EventReceiver>, Arc::clone(&engine) as Arc<dyn FilterCallback>, "g0")
        .unwrap();

    let src = Filter::new("src", FilterType::Source, Box::new(SourceTap::default()));
    let plugin = Arc::new(ScriptedPlugin::default());
    let mode = AsyncCodecMode::new("adec", Arc::clone(&plugin) as Arc<dyn CodecPlugin>, StreamType::RawAudio, 16);
    let adec = Filter::new(
        "adec",
        FilterType::AudioDecoder,
        Box::new(CodecFilter::new(
            Arc::clone(&plugin) as Arc<dyn CodecPlugin>,
            Box::new(mode),
        )),
    );

    let heads = pipeline.add_head_filters(vec![src]).unwrap();
    pipeline
        .link_filters(heads[0], vec![adec], StreamType::EncodedAudio)
        .unwrap();

    pipeline.prepare().unwrap();
    assert!(engine.wait_for(EventType::Ready, Duration::from_secs(5)));
    pipeline.wait_all_state(FilterState::Ready).unwrap();

    // Exactly one READY, attributed to the pipeline, not the filters.
    assert_eq!(engine.count_of(EventType::Ready), 1);
    assert_eq!(engine.sources_of(EventType::Ready), vec!["playback"]);
    assert!(plugin.saw("init"));
    assert!(plugin.saw("prepare"));

    pipeline.release().unwrap();
}

#[test]
fn flush_marks_pending_jobs_stale() {
    init_logging();
    #[derive(Default)]
    struct DropLog {
        drops: Arc<Mutex<Vec<bool>>>,
    }
    impl FilterBehavior for DropLog {
        fn do_process_input_buffer(&mut self, _ctx: &FilterContext, dropping: bool) -> Result<()> {
            self.drops.lock().unwrap().push(dropping);
            Ok(())
        }
    }

    let engine = Engine::new();
    let pipeline = Pipeline::new("p");
    pipeline
        .init(Arc::clone(&engine) as Arc<dyn EventReceiver>, Arc::clone(&engine) as Arc<dyn FilterCallback>, "g0")
        .unwrap();

    let log = DropLog::default();
    let drops = Arc::clone(&log.drops);
    let filter = Filter::new("adec", FilterType::AudioDecoder, Box::new(log));
    pipeline.add_head_filters(vec![Arc::clone(&filter)]).unwrap();

    pipeline.prepare().unwrap();
    pipeline.wait_all_state(FilterState::Ready).unwrap();

    // Jobs submitted before the flush; the task only runs them after start.
    for _ in 0..3 {
        filter.process_input_buffer(Duration::ZERO).unwrap();
    }
    pipeline.flush().unwrap();
    filter.process_input_buffer(Duration::ZERO).unwrap();

    pipeline.start().unwrap();
    pipeline.wait_all_state(FilterState::Running).unwrap();
    std::thread::sleep(Duration::from_millis(150));

    assert_eq!(*drops.lock().unwrap(), vec![true, true, true, false]);
    pipeline.release().unwrap();
}

#[test]
fn busy_codec_accepts_input_on_third_attempt() {
    init_logging();
    let engine = Engine::new();
    let pipeline = Pipeline::new("p");
    pipeline
        .init(Arc::clone(&engine) as Arc<dyn EventReceiver>, Arc::clone(&engine) as Arc<dyn FilterCallback>, "g0")
        .unwrap();

    let tap = SourceTap::default();
    let port = Arc::clone(&tap.port);
    let src = Filter::new("src", FilterType::Source, Box::new(tap));

    let plugin = Arc::new(ScriptedPlugin {
        reject_inputs: AtomicU32::new(2),
        ..Default::default()
    });
    let mode = AsyncCodecMode::new("adec", Arc::clone(&plugin) as Arc<dyn CodecPlugin>, StreamType::RawAudio, 16);
    let adec = Filter::new(
        "adec",
        FilterType::AudioDecoder,
        Box::new(CodecFilter::new(
            Arc::clone(&plugin) as Arc<dyn CodecPlugin>,
            Box::new(mode),
        )),
    );

    let heads = pipeline.add_head_filters(vec![src]).unwrap();
    pipeline
        .link_filters(heads[0], vec![adec], StreamType::EncodedAudio)
        .unwrap();

    pipeline.prepare().unwrap();
    pipeline.wait_all_state(FilterState::Ready).unwrap();
    pipeline.start().unwrap();
    pipeline.wait_all_state(FilterState::Running).unwrap();

    let port = port.lock().unwrap().clone().expect("port bound during link");
    port.push(buffer(1)).unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    while plugin.inputs_accepted.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    // Two Again responses were burned, then the buffer went through.
    assert_eq!(plugin.inputs_accepted.load(Ordering::SeqCst), 1);
    assert_eq!(plugin.reject_inputs.load(Ordering::SeqCst), 0);

    pipeline.stop().unwrap();
    pipeline.release().unwrap();
}

#[test]
fn release_with_idle_workers_does_not_deadlock() {
    init_logging();
    let engine = Engine::new();
    let pipeline = Pipeline::new("p");
    pipeline
        .init(Arc::clone(&engine) as Arc<dyn EventReceiver>, Arc::clone(&engine) as Arc<dyn FilterCallback>, "g0")
        .unwrap();

    let plugin = Arc::new(ScriptedPlugin::default());
    let mode = AsyncCodecMode::new("adec", Arc::clone(&plugin) as Arc<dyn CodecPlugin>, StreamType::RawAudio, 16);
    let adec = Filter::new(
        "adec",
        FilterType::AudioDecoder,
        Box::new(CodecFilter::new(
            Arc::clone(&plugin) as Arc<dyn CodecPlugin>,
            Box::new(mode),
        )),
    );
    pipeline.add_head_filters(vec![adec]).unwrap();

    pipeline.prepare().unwrap();
    pipeline.wait_all_state(FilterState::Ready).unwrap();
    pipeline.start().unwrap();
    pipeline.wait_all_state(FilterState::Running).unwrap();

    // Workers are now parked on an empty input queue.
    std::thread::sleep(Duration::from_millis(100));

    let start = Instant::now();
    pipeline.stop().unwrap();
    pipeline.release().unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));

    // Workers stopped before the plugin, plugin stopped before teardown.
    assert!(plugin.saw("stop"));
    assert!(plugin.saw("deinit"));
}

#[test]
fn factory_last_registration_wins_end_to_end() {
    init_logging();
    let factory = FilterFactory::new();
    factory.register(
        FilterType::AudioSink,
        Box::new(|name| {
            Filter::with_mode(
                format!("g1:{name}"),
                FilterType::AudioSink,
                ProcessingMode::Sync,
                Box::new(Noop),
            )
        }),
    );
    let replaced = factory.register(
        FilterType::AudioSink,
        Box::new(|name| {
            Filter::with_mode(
                format!("g2:{name}"),
                FilterType::AudioSink,
                ProcessingMode::Sync,
                Box::new(Noop),
            )
        }),
    );
    assert!(replaced);

    let engine = Engine::new();
    let pipeline = Pipeline::new("p");
    pipeline
        .init(Arc::clone(&engine) as Arc<dyn EventReceiver>, Arc::clone(&engine) as Arc<dyn FilterCallback>, "g0")
        .unwrap();

    let sink = factory.create_filter("asink", FilterType::AudioSink).unwrap();
    assert_eq!(sink.name(), "g2:asink");
    pipeline.add_head_filters(vec![sink]).unwrap();
    pipeline.prepare().unwrap();
    pipeline.wait_all_state(FilterState::Ready).unwrap();
}

#[test]
fn plugin_start_failure_isolates_to_one_branch() {
    init_logging();
    let engine = Engine::new();
    let pipeline = Pipeline::new("p");
    pipeline
        .init(Arc::clone(&engine) as Arc<dyn EventReceiver>, Arc::clone(&engine) as Arc<dyn FilterCallback>, "g0")
        .unwrap();

    let bad_plugin = Arc::new(ScriptedPlugin {
        fail_start: true,
        ..Default::default()
    });
    let bad_mode = AsyncCodecMode::new("adec", Arc::clone(&bad_plugin) as Arc<dyn CodecPlugin>, StreamType::RawAudio, 16);
    let bad = Filter::new(
        "adec",
        FilterType::AudioDecoder,
        Box::new(CodecFilter::new(
            Arc::clone(&bad_plugin) as Arc<dyn CodecPlugin>,
            Box::new(bad_mode),
        )),
    );

    let good = Filter::new("vdec", FilterType::VideoDecoder, Box::new(Noop));

    pipeline
        .add_head_filters(vec![Arc::clone(&bad), Arc::clone(&good)])
        .unwrap();
    pipeline.prepare().unwrap();
    pipeline.wait_all_state(FilterState::Ready).unwrap();

    pipeline.start().unwrap();
    assert!(engine.wait_for(EventType::Error, Duration::from_secs(5)));

    good.wait_all_state(pipeline.arena(), FilterState::Running)
        .unwrap();
    assert_eq!(good.state(), FilterState::Running);
    assert_eq!(bad.state(), FilterState::Error);
    assert_eq!(engine.sources_of(EventType::Error), vec!["adec"]);

    pipeline.release().unwrap();
}
