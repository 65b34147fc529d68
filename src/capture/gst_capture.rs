//! GStreamer-backed network stream capture (RTSP / HTTP) with hardware-agnostic decode

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{debug, info, warn};

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat};
use crate::capture::FrameSource;
use crate::error::ConnectionError;
use crate::utils::redact_descriptor;
use crate::StreamConfig;

/// Network camera source decoding to packed RGB
pub struct GstCapture {
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    read_timeout: gst::ClockTime,
    sequence: AtomicU64,
    closed: AtomicBool,
    descriptor: String, // Redacted, for logs
}

impl GstCapture {
    /// Build and start a pipeline for `descriptor` using explicit stream options.
    pub fn with_config(descriptor: &str, config: &StreamConfig) -> Result<Self, ConnectionError> {
        let redacted = redact_descriptor(descriptor);

        gst::init().map_err(|e| ConnectionError::Init(e.to_string()))?;

        info!("Opening stream {}", redacted);

        let pipeline_str = Self::build_pipeline_string(descriptor, config)
            .ok_or_else(|| ConnectionError::UnsupportedScheme(redacted.clone()))?;
        debug!(
            "Pipeline: {}",
            pipeline_str.replace(descriptor, &redacted)
        );

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| ConnectionError::Pipeline(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| ConnectionError::Pipeline("not a pipeline".into()))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| ConnectionError::Pipeline("appsink element not found".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| ConnectionError::Pipeline("appsink downcast failed".into()))?;

        // Keep only the newest decoded frame; never sync to the clock
        appsink.set_property("emit-signals", false);
        appsink.set_property("max-buffers", 1u32);
        appsink.set_property("drop", true);
        appsink.set_property("sync", false);

        let capture = Self {
            pipeline,
            appsink,
            read_timeout: gst::ClockTime::from_mseconds(config.read_timeout_ms),
            sequence: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            descriptor: redacted,
        };
        capture.start_stream(config.connect_timeout_ms)?;
        Ok(capture)
    }

    /// Pipeline string for the descriptor's scheme, `None` when unsupported
    fn build_pipeline_string(descriptor: &str, config: &StreamConfig) -> Option<String> {
        let (scheme, _) = descriptor.split_once("://")?;
        let sink = "videoconvert ! video/x-raw,format=RGB ! appsink name=appsink";

        match scheme {
            "rtsp" | "rtsps" => {
                let protocols = if config.tcp { " protocols=tcp" } else { "" };
                Some(format!(
                    "rtspsrc location=\"{}\" latency={}{} ! decodebin ! {}",
                    descriptor, config.latency_ms, protocols, sink
                ))
            }
            "http" | "https" => Some(format!(
                "uridecodebin uri=\"{}\" ! {}",
                descriptor, sink
            )),
            _ => None,
        }
    }

    /// Move the pipeline to Playing and wait for it to settle or fail
    fn start_stream(&self, connect_timeout_ms: u64) -> Result<(), ConnectionError> {
        let start_failed = |reason: String| ConnectionError::Start {
            descriptor: self.descriptor.clone(),
            reason,
        };

        if let Err(e) = self.pipeline.set_state(gst::State::Playing) {
            self.close();
            return Err(start_failed(format!("{:?}", e)));
        }

        let (state_change, _, _) = self
            .pipeline
            .state(Some(gst::ClockTime::from_mseconds(connect_timeout_ms)));

        let result = match state_change {
            Ok(gst::StateChangeSuccess::Success) | Ok(gst::StateChangeSuccess::NoPreroll) => {
                info!("Stream {} playing", self.descriptor);
                Ok(())
            }
            Ok(gst::StateChangeSuccess::Async) => {
                Err(ConnectionError::Timeout(self.descriptor.clone()))
            }
            Err(_) => Err(start_failed(self.bus_error().unwrap_or_else(|| {
                "pipeline refused to play".to_string()
            }))),
        };

        if result.is_err() {
            self.close();
        }
        result
    }

    /// First error message waiting on the bus, if any
    fn bus_error(&self) -> Option<String> {
        let bus = self.pipeline.bus()?;
        let msg = bus.pop_filtered(&[gst::MessageType::Error])?;
        match msg.view() {
            gst::MessageView::Error(err) => Some(err.error().to_string()),
            _ => None,
        }
    }

    /// Convert a pulled sample into a [`Frame`]
    fn sample_to_frame(&self, sample: gst::Sample) -> Option<Frame> {
        let timestamp = Instant::now();

        let buffer = sample.buffer()?;
        let caps = sample.caps()?;
        let video_info = gst_video::VideoInfo::from_caps(caps).ok()?;

        // Map buffer for reading; the copy detaches us from the pipeline's pool
        let map = buffer.map_readable().ok()?;
        let data = Bytes::copy_from_slice(map.as_slice());

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let stride = video_info
            .stride()
            .first()
            .map(|s| *s as u32)
            .unwrap_or(video_info.width() * 3);

        let meta = FrameMetadata {
            sequence,
            width: video_info.width(),
            height: video_info.height(),
            stride,
            format: PixelFormat::Rgb24, // Output is always RGB after conversion
            device_timestamp: buffer.pts().map(|pts| pts.into()),
        };

        Some(Frame {
            data,
            meta: meta.into(),
            timestamp,
        })
    }
}

impl FrameSource for GstCapture {
    /// Options come from the global [`CONFIG`](crate::CONFIG).
    fn open(descriptor: &str) -> Result<Self, ConnectionError> {
        let config = crate::CONFIG.load();
        Self::with_config(descriptor, &config.stream)
    }

    fn read_one(&self) -> Option<Frame> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        // Timeout, EOS and flushing all surface as a miss
        let Some(sample) = self.appsink.try_pull_sample(Some(self.read_timeout)) else {
            debug!("No sample within {} ms", self.read_timeout.mseconds());
            return None;
        };

        let frame = self.sample_to_frame(sample);
        if frame.is_none() {
            warn!("Dropping undecodable sample from {}", self.descriptor);
        }
        frame
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing stream {}", self.descriptor);
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!("Failed to stop pipeline: {:?}", e);
        }
    }
}

impl Drop for GstCapture {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtsp_pipeline_uses_tcp_and_latency() {
        let config = crate::Config::default().stream;
        let pipeline =
            GstCapture::build_pipeline_string("rtsp://u:p@10.0.0.2:554/main", &config).unwrap();
        assert!(pipeline.starts_with("rtspsrc location=\"rtsp://u:p@10.0.0.2:554/main\""));
        assert!(pipeline.contains("latency=100 protocols=tcp"));
        assert!(pipeline.ends_with("appsink name=appsink"));
    }

    #[test]
    fn unsupported_scheme_has_no_pipeline() {
        let config = crate::Config::default().stream;
        assert!(GstCapture::build_pipeline_string("synthetic://64x48", &config).is_none());
        assert!(GstCapture::build_pipeline_string("/dev/video0", &config).is_none());
    }
}
