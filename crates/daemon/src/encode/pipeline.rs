//! Pipeline description builder for gst-launch
//!
//! Produces the ordered stage tokens of the encode pipeline:
//! source → video-only filter → ingress queue → progress probe → pixel
//! conversion → encoder → parser → egress queue → chunked sink.

use crate::config::{Backend, Container};
use crate::rate_control::RateControlPlan;
use crate::request::TranscodeRequest;
use std::path::Path;

/// Ingress queue depth, in buffers (decoded frames).
const INGRESS_QUEUE_BUFFERS: u32 = 32;

/// Egress queue depth, in buffers (encoded access units).
const EGRESS_QUEUE_BUFFERS: u32 = 256;

/// Seconds between progress-probe reports.
pub const PROGRESS_UPDATE_SECS: u32 = 1;

/// Fragment length for the incrementally written MP4 chunks, in milliseconds.
const MP4_FRAGMENT_MS: u32 = 1000;

/// Ordered pipeline tokens, passed verbatim as subprocess arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSpec {
    pub args: Vec<String>,
}

/// Normalize a path to the forward-slash form the engine expects.
pub fn pipeline_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// `file://` URI for a local path.
///
/// Drive-letter paths become `file:///C:/...`; spaces are percent-encoded.
pub fn file_uri(path: &Path) -> String {
    let normalized = pipeline_path(path).replace('%', "%25").replace(' ', "%20");
    let bytes = normalized.as_bytes();
    let has_drive = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';

    if has_drive {
        format!("file:///{}", normalized)
    } else if normalized.starts_with('/') {
        format!("file://{}", normalized)
    } else {
        format!("file:///{}", normalized)
    }
}

/// Name of the chunk file with the given 1-based index.
pub fn chunk_file_name(base_name: &str, index: u32, container: Container) -> String {
    format!("{}_{:02}.{}", base_name, index, container.extension())
}

/// Intermediate raw format the encoder accepts.
pub fn pixel_format(backend: Backend) -> &'static str {
    if backend.is_hardware() {
        "NV12"
    } else {
        "I420"
    }
}

fn sink_tokens(request: &TranscodeRequest) -> Vec<String> {
    let container = request.container();
    let pattern = request
        .output_dir()
        .join(format!("{}_%02d.{}", request.base_name(), container.extension()));
    let max_size_time_ns = request.chunk_duration().as_nanos();

    let mut sink = vec![
        "splitmuxsink".to_string(),
        format!("location={}", pipeline_path(&pattern)),
        "start-index=1".to_string(),
        format!("max-size-time={}", max_size_time_ns),
        format!("muxer-factory={}", container.muxer()),
    ];

    // MP4 would otherwise hold the index until EOS; fragments keep each
    // chunk readable while it is being written.
    if container == Container::Mp4 {
        sink.push(format!(
            "muxer-properties=properties,fragment-duration={},streamable=true",
            MP4_FRAGMENT_MS
        ));
    }

    sink
}

fn stage(tokens: Vec<String>, args: &mut Vec<String>) {
    // args[0] is the "-e" flag, not a stage
    if args.len() > 1 {
        args.push("!".to_string());
    }
    args.extend(tokens);
}

/// Build the gst-launch argument list for `request` using `plan`.
pub fn build(request: &TranscodeRequest, plan: &RateControlPlan) -> PipelineSpec {
    let backend = request.backend();
    let mut args: Vec<String> = vec!["-e".to_string()];

    stage(
        vec![
            "filesrc".to_string(),
            format!("location={}", pipeline_path(request.input_path())),
        ],
        &mut args,
    );
    stage(vec!["decodebin".to_string()], &mut args);
    stage(vec!["video/x-raw".to_string()], &mut args);
    stage(
        vec![
            "queue".to_string(),
            format!("max-size-buffers={}", INGRESS_QUEUE_BUFFERS),
            "max-size-bytes=0".to_string(),
            "max-size-time=0".to_string(),
        ],
        &mut args,
    );
    stage(
        vec![
            "progressreport".to_string(),
            format!("update-freq={}", PROGRESS_UPDATE_SECS),
            "silent=false".to_string(),
        ],
        &mut args,
    );
    stage(vec!["videoconvert".to_string()], &mut args);
    stage(
        vec![format!("video/x-raw,format={}", pixel_format(backend))],
        &mut args,
    );

    let mut encoder = vec![backend.element().to_string()];
    encoder.extend(plan.backend_args.iter().map(|(k, v)| format!("{}={}", k, v)));
    stage(encoder, &mut args);

    stage(vec!["h264parse".to_string()], &mut args);
    stage(
        vec![
            "queue".to_string(),
            format!("max-size-buffers={}", EGRESS_QUEUE_BUFFERS),
            "max-size-bytes=0".to_string(),
            "max-size-time=0".to_string(),
        ],
        &mut args,
    );
    stage(sink_tokens(request), &mut args);

    PipelineSpec { args }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_control::{plan, RateControl};
    use crate::request::{CompressionRatio, EncodeSettings};
    use crate::resolve::DurationEstimate;
    use proptest::prelude::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn request(backend: Backend, container: Container, input: &str) -> TranscodeRequest {
        TranscodeRequest::new(
            PathBuf::from(input),
            PathBuf::from("/out/shows"),
            EncodeSettings {
                chunk_duration: Duration::from_secs(3600),
                container,
                backend,
                compression_ratio: Some(CompressionRatio::try_from(2).unwrap()),
                speed_preset: None,
            },
        )
    }

    fn trusted_plan(request: &TranscodeRequest) -> RateControlPlan {
        let estimate = DurationEstimate {
            duration_secs: 7200.0,
            is_estimated: false,
            source_bitrate_kbps: Some(20_000.0),
        };
        plan(request, &estimate).unwrap()
    }

    /// Split argv back into stages at the `!` separators.
    fn stages(spec: &PipelineSpec) -> Vec<Vec<String>> {
        spec.args[1..]
            .split(|a| a == "!")
            .map(|s| s.to_vec())
            .collect()
    }

    fn stage_named<'a>(stages: &'a [Vec<String>], element: &str) -> &'a [String] {
        stages
            .iter()
            .find(|s| s[0] == element)
            .map(|s| s.as_slice())
            .unwrap_or_else(|| panic!("no {} stage in {:?}", element, stages))
    }

    #[test]
    fn test_stage_order() {
        let req = request(Backend::X264, Container::Mkv, "/media/movie.mkv");
        let spec = build(&req, &trusted_plan(&req));
        let heads: Vec<String> = stages(&spec).into_iter().map(|s| s[0].clone()).collect();

        assert_eq!(spec.args[0], "-e");
        assert_eq!(
            heads,
            vec![
                "filesrc",
                "decodebin",
                "video/x-raw",
                "queue",
                "progressreport",
                "videoconvert",
                "video/x-raw,format=I420",
                "x264enc",
                "h264parse",
                "queue",
                "splitmuxsink",
            ]
        );
    }

    #[test]
    fn test_encoder_stage_carries_plan_args() {
        let req = request(Backend::Nvenc, Container::Mkv, "/media/movie.mkv");
        let rc = trusted_plan(&req);
        assert_eq!(rc.control, RateControl::Bitrate { target_kbps: 10_000 });

        let spec = build(&req, &rc);
        let all = stages(&spec);
        let encoder = stage_named(&all, "nvh264enc");
        assert!(encoder.contains(&"rc-mode=vbr".to_string()));
        assert!(encoder.contains(&"bitrate=10000".to_string()));
    }

    #[test]
    fn test_hardware_backend_uses_nv12() {
        let req = request(Backend::Qsv, Container::Mkv, "/media/movie.mkv");
        let spec = build(&req, &trusted_plan(&req));
        assert!(spec.args.contains(&"video/x-raw,format=NV12".to_string()));
    }

    #[test]
    fn test_sink_for_mkv_and_ts() {
        for (container, muxer) in [(Container::Mkv, "matroskamux"), (Container::Ts, "mpegtsmux")] {
            let req = request(Backend::X264, container, "/media/movie.mkv");
            let spec = build(&req, &trusted_plan(&req));
            let all = stages(&spec);
            let sink = stage_named(&all, "splitmuxsink");

            assert!(sink.contains(&format!(
                "location=/out/shows/movie_%02d.{}",
                container.extension()
            )));
            assert!(sink.contains(&"start-index=1".to_string()));
            assert!(sink.contains(&"max-size-time=3600000000000".to_string()));
            assert!(sink.contains(&format!("muxer-factory={}", muxer)));
            assert!(!sink.iter().any(|a| a.starts_with("muxer-properties")));
        }
    }

    #[test]
    fn test_mp4_gets_fragmented_muxing() {
        let req = request(Backend::X264, Container::Mp4, "/media/movie.mkv");
        let spec = build(&req, &trusted_plan(&req));
        assert!(spec.args.contains(
            &"muxer-properties=properties,fragment-duration=1000,streamable=true".to_string()
        ));
    }

    #[test]
    fn test_windows_paths_are_normalized() {
        let req = request(Backend::X264, Container::Mkv, r"C:\Videos\movie.mkv");
        let spec = build(&req, &trusted_plan(&req));
        assert!(spec.args.contains(&"location=C:/Videos/movie.mkv".to_string()));
    }

    #[test]
    fn test_file_uri() {
        assert_eq!(file_uri(Path::new("/media/a b.mkv")), "file:///media/a%20b.mkv");
        assert_eq!(file_uri(Path::new(r"D:\clips\a.mkv")), "file:///D:/clips/a.mkv");
        assert_eq!(file_uri(Path::new("rel/a.mkv")), "file:///rel/a.mkv");
    }

    #[test]
    fn test_chunk_file_name() {
        assert_eq!(chunk_file_name("movie", 1, Container::Mkv), "movie_01.mkv");
        assert_eq!(chunk_file_name("movie", 12, Container::Ts), "movie_12.ts");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Every pipeline has exactly one encoder and one sink, whatever the inputs.
        #[test]
        fn prop_pipeline_completeness(
            backend in prop::sample::select(Backend::ALL.to_vec()),
            container in prop::sample::select(Container::ALL.to_vec()),
            name in "[a-zA-Z0-9_]{1,20}",
        ) {
            let req = request(backend, container, &format!("/media/{}.mkv", name));
            let spec = build(&req, &trusted_plan(&req));
            let all = stages(&spec);

            prop_assert_eq!(all.iter().filter(|s| s[0] == backend.element()).count(), 1);
            prop_assert_eq!(all.iter().filter(|s| s[0] == "splitmuxsink").count(), 1);
            prop_assert_eq!(all.last().map(|s| s[0].as_str()), Some("splitmuxsink"));
            let location = format!("location=/media/{}.mkv", name);
            prop_assert!(spec.args.contains(&location));
        }
    }
}
