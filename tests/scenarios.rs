//! End-to-end scenarios: full decode graphs built from scripted containers
//! and codecs, driven through URIs.

mod common;

use common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use decodebin::{
    Caps, DecodeBin, DecodeError, Element, ElementState, Message, SlotMode, Structure,
};

const WAIT: Duration = Duration::from_secs(5);

fn h264_caps() -> Caps {
    Structure::new("video/x-h264").field("stream-format", "byte-stream").into()
}

fn mpeg_audio_caps() -> Caps {
    Structure::new("audio/mpeg").field("mpegversion", 1).into()
}

/// A container with a video and an audio track decodes into two output
/// pads, video first, with a single no-more-pads emission.
#[test]
fn test_av_container_exposes_two_sorted_pads() {
    let registry = base_registry();
    register_demuxer(
        &registry,
        "oggdemux",
        Caps::simple("application/ogg"),
        vec![vec![
            StreamSpec::new("stream/audio", mpeg_audio_caps(), 3, 64),
            StreamSpec::new("stream/video", h264_caps(), 4, 128),
        ]],
    );
    register_decoder(&registry, "h264dec", h264_caps(), Caps::simple("video/x-raw"));
    register_decoder(
        &registry,
        "mpegaudiodec",
        mpeg_audio_caps(),
        Caps::simple("audio/x-raw"),
    );

    let (_file, uri) = temp_media_file(&ogg_bytes(4000));
    let bin = DecodeBin::new("dbin", registry);
    let harness = SinkHarness::attach(&bin);
    bin.set_uri(Some(&uri));
    bin.set_state(ElementState::Paused).unwrap();

    assert!(wait_async_done(&bin.bus(), WAIT));
    assert!(harness.wait_all_eos(2, WAIT));

    let pads = bin.src_pads();
    assert_eq!(pads.len(), 2);
    // Video sorts before audio regardless of discovery order.
    assert_eq!(pads[0].name(), "src_0");
    assert_eq!(
        pads[0].current_caps().unwrap().media_type(),
        Some("video/x-raw")
    );
    assert_eq!(pads[1].name(), "src_1");
    assert_eq!(
        pads[1].current_caps().unwrap().media_type(),
        Some("audio/x-raw")
    );
    assert_eq!(harness.no_more_pads.load(Ordering::SeqCst), 1);
    assert_eq!(harness.pads_removed.load(Ordering::SeqCst), 0);

    let video = harness.sink("src_0").unwrap();
    assert_eq!(video.buffer_count(), 4);
    let audio = harness.sink("src_1").unwrap();
    assert_eq!(audio.buffer_count(), 3);

    // Exactly one async-start / async-done pair.
    let messages = bin.bus().snapshot();
    let starts = messages
        .iter()
        .filter(|m| matches!(m, Message::AsyncStart { .. }))
        .count();
    let dones = messages
        .iter()
        .filter(|m| matches!(m, Message::AsyncDone { .. }))
        .count();
    assert_eq!((starts, dones), (1, 1));

    bin.set_state(ElementState::Null).unwrap();
}

/// A chained container switches groups internally; the audio
/// output pad is reused, nothing is removed externally, and `drained`
/// fires only at the very end.
#[test]
fn test_chained_container_switches_groups_and_reuses_pad() {
    let registry = base_registry();
    let vorbis: Caps = Caps::simple("audio/x-vorbis");
    register_demuxer(
        &registry,
        "oggdemux",
        Caps::simple("application/ogg"),
        vec![
            vec![StreamSpec::new("chain-a/audio", vorbis.clone(), 3, 32)],
            vec![StreamSpec::new("chain-b/audio", vorbis.clone(), 5, 32)],
        ],
    );
    register_decoder(&registry, "vorbisdec", vorbis, Caps::simple("audio/x-raw"));

    let (_file, uri) = temp_media_file(&ogg_bytes(2000));
    let bin = DecodeBin::new("dbin", registry);
    let harness = SinkHarness::attach(&bin);
    let drained = Arc::new(AtomicUsize::new(0));
    let d = drained.clone();
    bin.on_drained(move || {
        d.fetch_add(1, Ordering::SeqCst);
    });
    bin.set_uri(Some(&uri));
    bin.set_state(ElementState::Paused).unwrap();

    assert!(harness.wait_all_eos(1, WAIT));

    assert_eq!(bin.src_pads().len(), 1);
    assert_eq!(bin.src_pads()[0].name(), "src_0");
    assert_eq!(harness.pads_added.load(Ordering::SeqCst), 1);
    assert_eq!(harness.pads_removed.load(Ordering::SeqCst), 0);

    let sink = harness.sink("src_0").unwrap();
    // Both chains flowed through the same external pad.
    assert_eq!(sink.buffer_count(), 8);
    assert_eq!(drained.load(Ordering::SeqCst), 1);

    bin.set_state(ElementState::Null).unwrap();
}

/// A remote MP3 stream is classified as `stream` and buffered through
/// a bounded queue reporting up to 100%.
#[test]
fn test_http_stream_gets_buffering_queue() {
    let registry = base_registry();
    register_net_source(
        &registry,
        "httpsrc",
        "http",
        mp3_bytes(30_000),
        decodebin::SchedulingFlags {
            seekable: false,
            sequential: true,
            bandwidth_limited: true,
        },
        None,
    );
    let mp3: Caps = Structure::new("audio/mpeg")
        .field("mpegversion", 1)
        .field("layer", 3)
        .into();
    register_decoder(&registry, "mpegaudiodec", mp3, Caps::simple("audio/x-raw"));

    let bin = DecodeBin::new("dbin", registry);
    let harness = SinkHarness::attach(&bin);
    bin.set_uri(Some("http://example.com/stream.mp3"));
    bin.set_state(ElementState::Paused).unwrap();

    assert!(harness.wait_all_eos(1, WAIT));

    let slots = bin.slot_manager().slots();
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].mode, SlotMode::Stream);
    let queue = slots[0].queue.as_ref().unwrap();
    assert_eq!(
        queue.property("max-size-bytes").unwrap().as_u64(),
        Some(10 * 1024 * 1024)
    );
    assert_eq!(
        queue.property("max-size-time").unwrap().as_u64(),
        Some(5_000_000_000)
    );

    // External buffering reporting ends at 100 and is posted as ours.
    assert!(wait_for_message(&bin.bus(), WAIT, |m| matches!(
        m,
        Message::Buffering { src, percent: 100 } if src == "dbin"
    )));

    bin.set_state(ElementState::Null).unwrap();
}

/// An adaptive manifest plugs its demuxer straight after typefind and
/// its outputs ride bitrate-managed queues.
#[test]
fn test_adaptive_manifest_uses_adaptive_slots() {
    let registry = base_registry();
    register_net_source(
        &registry,
        "httpsrc",
        "http",
        hls_bytes(),
        decodebin::SchedulingFlags {
            seekable: false,
            sequential: true,
            bandwidth_limited: true,
        },
        None,
    );
    register_adaptive_demuxer(
        &registry,
        "hlsdemux",
        Caps::simple("application/x-hls"),
        vec![vec![StreamSpec::new("hls/video", h264_caps(), 3, 256)]],
    );
    register_decoder(&registry, "h264dec", h264_caps(), Caps::simple("video/x-raw"));

    let bin = DecodeBin::new("dbin", registry);
    let harness = SinkHarness::attach(&bin);
    bin.set_uri(Some("http://example.com/master.m3u8"));
    bin.set_state(ElementState::Paused).unwrap();

    assert!(harness.wait_all_eos(1, WAIT));
    let slots = bin.slot_manager().slots();
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].mode, SlotMode::Adaptive);
    assert!(slots[0].queue.is_some());

    bin.set_state(ElementState::Null).unwrap();
}

/// An unknown URI scheme fails source construction; async-done still
/// arrives and nothing is exposed.
#[test]
fn test_unknown_scheme_posts_source_error() {
    let registry = base_registry();
    let bin = DecodeBin::new("dbin", registry);
    bin.set_uri(Some("gopher://example.com/file"));
    assert!(bin.set_state(ElementState::Paused).is_err());

    assert!(wait_for_message(&bin.bus(), WAIT, |m| matches!(
        m,
        Message::Error {
            error: DecodeError::SourceConstruction { .. },
            ..
        }
    )));
    assert!(wait_async_done(&bin.bus(), WAIT));
    assert!(bin.src_pads().is_empty());
}

/// With `expose-all-streams` off and an audio-only stop set, the video
/// stream is silently discarded.
#[test]
fn test_expose_all_streams_false_discards_video() {
    let registry = base_registry();
    register_demuxer(
        &registry,
        "oggdemux",
        Caps::simple("application/ogg"),
        vec![vec![
            StreamSpec::new("stream/video", h264_caps(), 2, 64),
            StreamSpec::new("stream/audio", mpeg_audio_caps(), 3, 64),
        ]],
    );
    register_decoder(&registry, "h264dec", h264_caps(), Caps::simple("video/x-raw"));
    register_decoder(
        &registry,
        "mpegaudiodec",
        mpeg_audio_caps(),
        Caps::simple("audio/x-raw"),
    );

    let (_file, uri) = temp_media_file(&ogg_bytes(2000));
    let bin = DecodeBin::new("dbin", registry);
    let harness = SinkHarness::attach(&bin);
    bin.update_config(|c| {
        c.expose_all_streams = false;
        c.caps = Caps::simple("audio/x-raw");
    });
    bin.set_uri(Some(&uri));
    bin.set_state(ElementState::Paused).unwrap();

    assert!(harness.wait_all_eos(1, WAIT));
    let pads = bin.src_pads();
    assert_eq!(pads.len(), 1);
    assert_eq!(pads[0].name(), "src_0");
    assert_eq!(
        pads[0].current_caps().unwrap().media_type(),
        Some("audio/x-raw")
    );
    // No error: the video stream was dropped, not failed.
    assert!(!bin.bus().snapshot().iter().any(|m| m.is_error()));

    bin.set_state(ElementState::Null).unwrap();
}

/// A source announcing raw caps within the stop set is exposed without
/// any handler.
#[test]
fn test_raw_source_exposed_directly() {
    let registry = Arc::new(decodebin::Registry::new());
    register_raw_source(
        &registry,
        "testraw",
        vec![7u8; 512],
        Caps::simple("audio/x-raw"),
    );

    let bin = DecodeBin::new("dbin", registry);
    let harness = SinkHarness::attach(&bin);
    bin.set_uri(Some("testraw://payload"));
    bin.set_state(ElementState::Paused).unwrap();

    assert!(harness.wait_all_eos(1, WAIT));
    let pads = bin.src_pads();
    assert_eq!(pads.len(), 1);
    assert_eq!(
        pads[0].current_caps().unwrap().media_type(),
        Some("audio/x-raw")
    );
    let sink = harness.sink("src_0").unwrap();
    assert_eq!(sink.byte_count(), 512);

    bin.set_state(ElementState::Null).unwrap();
}

/// A parser accepting its own output is never instantiated twice in
/// one chain.
#[test]
fn test_parser_not_plugged_twice() {
    let registry = base_registry();
    let parses = register_parser(
        &registry,
        "mpegaudioparse",
        mpeg_audio_caps(),
        mpeg_audio_caps(),
    );
    register_decoder(
        &registry,
        "mpegaudiodec",
        mpeg_audio_caps(),
        Caps::simple("audio/x-raw"),
    );
    register_demuxer(
        &registry,
        "oggdemux",
        Caps::simple("application/ogg"),
        vec![vec![StreamSpec::new("stream/audio", mpeg_audio_caps(), 2, 32)]],
    );

    let (_file, uri) = temp_media_file(&ogg_bytes(1000));
    let bin = DecodeBin::new("dbin", registry);
    let harness = SinkHarness::attach(&bin);
    bin.set_uri(Some(&uri));
    bin.set_state(ElementState::Paused).unwrap();

    assert!(harness.wait_all_eos(1, WAIT));
    assert_eq!(parses.load(Ordering::SeqCst), 1);
    assert_eq!(
        bin.src_pads()[0].current_caps().unwrap().media_type(),
        Some("audio/x-raw")
    );

    bin.set_state(ElementState::Null).unwrap();
}

/// Every stream ending before any buffer yields a NoBuffers error.
#[test]
fn test_all_streams_eos_without_buffers() {
    let registry = base_registry();
    let unfixed: Caps = Structure::new("audio/x-unknown")
        .field("rate", decodebin::FieldValue::IntRange { min: 1, max: 96000 })
        .into();
    register_demuxer(
        &registry,
        "oggdemux",
        Caps::simple("application/ogg"),
        vec![vec![StreamSpec {
            id: "stream/empty".to_string(),
            caps: unfixed,
            payload: Vec::new(),
        }]],
    );

    let (_file, uri) = temp_media_file(&ogg_bytes(1000));
    let bin = DecodeBin::new("dbin", registry);
    bin.set_uri(Some(&uri));
    bin.set_state(ElementState::Paused).unwrap();

    assert!(wait_for_message(&bin.bus(), WAIT, |m| matches!(
        m,
        Message::Error {
            error: DecodeError::NoBuffers,
            ..
        }
    )));
    assert!(wait_async_done(&bin.bus(), WAIT));
    assert!(bin.src_pads().is_empty());

    bin.set_state(ElementState::Null).unwrap();
}

/// Removing and re-registering a factory reproduces the same tree.
#[test]
fn test_factory_reregistration_reproduces_tree() {
    let registry = base_registry();
    register_demuxer(
        &registry,
        "oggdemux",
        Caps::simple("application/ogg"),
        vec![vec![
            StreamSpec::new("stream/video", h264_caps(), 2, 64),
            StreamSpec::new("stream/audio", mpeg_audio_caps(), 2, 64),
        ]],
    );
    register_decoder(&registry, "h264dec", h264_caps(), Caps::simple("video/x-raw"));
    register_decoder(
        &registry,
        "mpegaudiodec",
        mpeg_audio_caps(),
        Caps::simple("audio/x-raw"),
    );
    let (_file, uri) = temp_media_file(&ogg_bytes(2000));

    let run = |registry: Arc<decodebin::Registry>| -> Vec<(String, String)> {
        let bin = DecodeBin::new("dbin", registry);
        let harness = SinkHarness::attach(&bin);
        bin.set_uri(Some(&uri));
        bin.set_state(ElementState::Paused).unwrap();
        assert!(harness.wait_all_eos(2, WAIT));
        let out = bin
            .src_pads()
            .iter()
            .map(|p| {
                (
                    p.name().to_string(),
                    p.current_caps().unwrap().to_string(),
                )
            })
            .collect();
        bin.set_state(ElementState::Null).unwrap();
        out
    };

    let first = run(registry.clone());
    let removed = registry.remove("h264dec").unwrap();
    registry.register(removed);
    let second = run(registry.clone());
    assert_eq!(first, second);
}

/// Shutdown mid-stream releases everything and the engine restarts clean.
#[test]
fn test_shutdown_and_restart() {
    let registry = base_registry();
    register_demuxer(
        &registry,
        "oggdemux",
        Caps::simple("application/ogg"),
        vec![vec![StreamSpec::new("stream/audio", mpeg_audio_caps(), 3, 64)]],
    );
    register_decoder(
        &registry,
        "mpegaudiodec",
        mpeg_audio_caps(),
        Caps::simple("audio/x-raw"),
    );
    let (_file, uri) = temp_media_file(&ogg_bytes(1500));

    let bin = DecodeBin::new("dbin", registry);
    let harness = SinkHarness::attach(&bin);
    bin.set_uri(Some(&uri));
    bin.set_state(ElementState::Paused).unwrap();
    assert!(wait_async_done(&bin.bus(), WAIT));

    bin.set_state(ElementState::Ready).unwrap();
    assert!(bin.src_pads().is_empty());

    // A second run from Ready works and exposes again.
    bin.bus().clear();
    bin.set_state(ElementState::Paused).unwrap();
    assert!(wait_async_done(&bin.bus(), WAIT));
    assert_eq!(bin.src_pads().len(), 1);
    let _ = harness;

    bin.set_state(ElementState::Null).unwrap();
}
