//! Buffering-layer behavior observable from outside: monotonic fill
//! reporting, download interposition, topology posting.

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;

use decodebin::{
    Buffer, Bus, Caps, DecodeBin, Element, ElementState, Message, ProbeMask, ProbeReturn, Queue2,
    SlotMode, Structure,
};

const WAIT: Duration = Duration::from_secs(5);

/// While nothing drains the queue, reported buffering only rises, reaching
/// 100 at the high watermark.
#[test]
fn test_buffering_reports_monotonic_while_filling() {
    let bus = Bus::new();
    let queue = Queue2::new("q");
    queue.set_bus(Some(bus.clone()));
    queue.set_use_buffering(true);
    queue
        .set_property(
            "max-size-bytes",
            decodebin::PropertyValue::UInt64(1000),
        )
        .unwrap();

    let out = decodebin::Pad::new("out", decodebin::PadDirection::Sink);
    queue.src_pad().link(&out).unwrap();
    // Hold the output so the queue can only fill.
    let probe = queue
        .src_pad()
        .add_probe(ProbeMask::block_downstream(), |_, _| ProbeReturn::Pass);
    queue.set_state(ElementState::Paused).unwrap();

    let sink = queue.sink_pad().clone();
    // One buffer leaves the queue before the probe suspends the pump, so
    // overshoot the capacity to guarantee the 100% mark.
    let producer = std::thread::spawn(move || {
        for _ in 0..12 {
            sink.chain(Buffer::new(vec![0u8; 100]));
        }
    });

    assert!(wait_for_message(&bus, WAIT, |m| matches!(
        m,
        Message::Buffering { percent: 100, .. }
    )));
    let percents: Vec<u32> = bus
        .snapshot()
        .iter()
        .filter_map(|m| match m {
            Message::Buffering { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{:?}", percents);
    assert_eq!(*percents.last().unwrap(), 100);

    queue.src_pad().remove_probe(probe);
    producer.join().unwrap();
    queue.set_state(ElementState::Null).unwrap();
}

/// `download=true` with a known duration interposes the download cache.
#[test]
fn test_download_mode_uses_cache_file() {
    let registry = base_registry();
    register_net_source(
        &registry,
        "httpsrc",
        "http",
        mp3_bytes(20_000),
        decodebin::SchedulingFlags {
            seekable: true,
            sequential: true,
            bandwidth_limited: true,
        },
        Some(120_000_000_000),
    );
    let mp3: Caps = Structure::new("audio/mpeg")
        .field("mpegversion", 1)
        .field("layer", 3)
        .into();
    register_decoder(&registry, "mpegaudiodec", mp3, Caps::simple("audio/x-raw"));

    let bin = DecodeBin::new("dbin", registry);
    bin.update_config(|c| c.download = true);
    let harness = SinkHarness::attach(&bin);
    bin.set_uri(Some("http://example.com/track.mp3"));
    bin.set_state(ElementState::Paused).unwrap();

    assert!(harness.wait_all_eos(1, WAIT));
    let slots = bin.slot_manager().slots();
    assert_eq!(slots.len(), 1);
    assert_eq!(slots[0].mode, SlotMode::Download);

    bin.set_state(ElementState::Null).unwrap();
}

/// `parse-streams` stops at parsed elementary streams and feeds them
/// through the shared interleaving queue.
#[test]
fn test_parse_streams_exposes_elementary() {
    let registry = base_registry();
    let mpeg: Caps = Structure::new("audio/mpeg").field("mpegversion", 1).into();
    register_demuxer(
        &registry,
        "oggdemux",
        Caps::simple("application/ogg"),
        vec![vec![StreamSpec::new("stream/audio", mpeg.clone(), 3, 48)]],
    );
    let parses = common::register_parser(&registry, "mpegaudioparse", mpeg.clone(), mpeg.clone());
    let decodes = register_decoder(&registry, "mpegaudiodec", mpeg, Caps::simple("audio/x-raw"));

    let (_file, uri) = temp_media_file(&ogg_bytes(1200));
    let bin = DecodeBin::new("dbin", registry);
    bin.update_config(|c| {
        c.parse_streams = true;
        c.use_buffering = true;
    });
    let harness = SinkHarness::attach(&bin);
    bin.set_uri(Some(&uri));
    bin.set_state(ElementState::Paused).unwrap();

    assert!(harness.wait_all_eos(1, WAIT));
    // Parsed, not decoded.
    assert_eq!(
        bin.src_pads()[0].current_caps().unwrap().media_type(),
        Some("audio/mpeg")
    );
    assert_eq!(parses.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(decodes.load(std::sync::atomic::Ordering::SeqCst), 0);
    let slots = bin.slot_manager().slots();
    assert_eq!(slots[0].mode, SlotMode::Parse);
    let parse_mq = bin.slot_manager().parse_mq().expect("shared parse queue");
    assert!(parse_mq.is_interleaved());
    assert!(parse_mq.syncs_by_running_time());

    bin.set_state(ElementState::Null).unwrap();
}

/// `post-stream-topology` emits the reconstructed tree on expose.
#[test]
fn test_stream_topology_message() {
    let registry = base_registry();
    register_demuxer(
        &registry,
        "oggdemux",
        Caps::simple("application/ogg"),
        vec![vec![
            StreamSpec::new("stream/video", Caps::simple("video/x-h264"), 2, 64),
            StreamSpec::new("stream/audio", Caps::simple("audio/mpeg"), 2, 64),
        ]],
    );
    register_decoder(
        &registry,
        "h264dec",
        Caps::simple("video/x-h264"),
        Caps::simple("video/x-raw"),
    );
    register_decoder(
        &registry,
        "mpegaudiodec",
        Caps::simple("audio/mpeg"),
        Caps::simple("audio/x-raw"),
    );

    let (_file, uri) = temp_media_file(&ogg_bytes(1500));
    let bin = DecodeBin::new("dbin", registry);
    bin.update_config(|c| c.post_stream_topology = true);
    let harness = SinkHarness::attach(&bin);
    bin.set_uri(Some(&uri));
    bin.set_state(ElementState::Paused).unwrap();

    assert!(harness.wait_all_eos(2, WAIT));
    let topology = bin.bus().snapshot().into_iter().find_map(|m| match m {
        Message::Element { name, payload, .. } if name == "stream-topology" => Some(payload),
        _ => None,
    });
    let topology = topology.expect("topology message posted");
    let children = topology["children"].as_array().expect("children array");
    assert_eq!(children.len(), 2);
    for child in children {
        assert_eq!(child["type"], "stream");
    }

    bin.set_state(ElementState::Null).unwrap();
}
