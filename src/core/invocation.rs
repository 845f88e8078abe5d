//! Invocation builder - turns a config snapshot and a monitor topology into
//! the exact command line of the capture process.
//!
//! Everything here is pure: the same inputs always produce the same
//! [`InvocationSpec`]. Creating the output directory is left to
//! [`InvocationSpec::prepare_output_dir`], which the supervisor calls right
//! before launching.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use super::config::{Encoder, RecorderConfig, DEFAULT_OUTPUT_PATTERN};
use super::identity::Identity;
use super::topology::Topology;

/// Errors from building an invocation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvocationError {
    #[error("No monitors detected")]
    NoMonitors,

    #[error("Bad token {{{token}}} in {label}. Allowed: {{username}}, {{session}}, {{host}}")]
    BadTemplate { label: String, token: String },
}

/// How each monitor is grabbed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CaptureBackend {
    /// Windows GDI screen grabber
    GdiGrab,
    /// X11 screen grabber on the given display
    X11Grab { display: String },
}

impl CaptureBackend {
    /// Backend for the platform we are running on
    pub fn native() -> Self {
        if cfg!(windows) {
            Self::GdiGrab
        } else {
            let display = std::env::var("DISPLAY")
                .ok()
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| ":0.0".to_string());
            Self::X11Grab { display }
        }
    }

    fn format(&self) -> &'static str {
        match self {
            Self::GdiGrab => "gdigrab",
            Self::X11Grab { .. } => "x11grab",
        }
    }
}

/// Everything needed to launch one capture run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvocationSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Directory segments are written to (the active output directory)
    pub output_dir: PathBuf,
    /// Full output path pattern handed to the segment muxer
    pub output_path: PathBuf,
}

impl InvocationSpec {
    /// Create the output directory if it does not exist yet
    pub fn prepare_output_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.output_dir)
    }

    /// Command line rendered for logging
    pub fn display_command(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                line.push('"');
                line.push_str(arg);
                line.push('"');
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

/// Build the capture command line
pub fn build_invocation(
    config: &RecorderConfig,
    topology: &Topology,
    identity: &Identity,
    backend: &CaptureBackend,
) -> Result<InvocationSpec, InvocationError> {
    if topology.is_empty() {
        return Err(InvocationError::NoMonitors);
    }

    let subdir = apply_template(&config.subdir_template, identity, "record_subdir_template")?;
    let output_dir = if subdir.trim().is_empty() {
        config.record_dir.clone()
    } else {
        config.record_dir.join(subdir.trim())
    };

    let mut pattern = apply_template(&config.output_pattern, identity, "output_pattern")?;
    if pattern.trim().is_empty() {
        pattern = DEFAULT_OUTPUT_PATTERN.to_string();
    }
    let output_path = output_dir.join(pattern.trim());

    let fps = config.fps.max(1);
    let segment = config.segment_seconds.max(1);

    let mut args = strings(&[
        "-hide_banner",
        "-loglevel",
        if config.verbose { "info" } else { "warning" },
        "-rtbufsize",
        "256M",
    ]);

    for monitor in topology.monitors() {
        args.extend(strings(&[
            "-thread_queue_size",
            "1024",
            "-probesize",
            "64M",
            "-f",
            backend.format(),
            "-framerate",
        ]));
        args.push(fps.to_string());
        args.extend(strings(&["-draw_mouse", "1", "-video_size"]));
        args.push(format!("{}x{}", monitor.width, monitor.height));

        match backend {
            CaptureBackend::GdiGrab => {
                args.push("-offset_x".to_string());
                args.push(monitor.left.to_string());
                args.push("-offset_y".to_string());
                args.push(monitor.top.to_string());
                args.push("-i".to_string());
                args.push("desktop".to_string());
            }
            CaptureBackend::X11Grab { display } => {
                args.push("-i".to_string());
                args.push(format!("{}+{},{}", display, monitor.left, monitor.top));
            }
        }
    }

    args.push("-filter_complex".to_string());
    args.push(filter_graph(topology, fps));

    args.extend(encoder_args(config.encoder(), config.crf));

    args.push("-g".to_string());
    args.push(gop_size(fps, segment).to_string());
    args.push("-force_key_frames".to_string());
    args.push(format!("expr:gte(t,n_forced*{})", segment));
    args.extend(strings(&["-map", "[final]", "-f", "segment", "-segment_time"]));
    args.push(segment.to_string());
    args.extend(strings(&[
        "-segment_atclocktime",
        "1",
        "-strftime",
        "1",
        "-reset_timestamps",
        "1",
    ]));
    args.push(output_path.to_string_lossy().into_owned());

    Ok(InvocationSpec {
        program: config.ffmpeg_path.clone(),
        args,
        output_dir,
        output_path,
    })
}

/// Frames between key frames, so every segment starts on one
pub fn gop_size(fps: u32, segment_seconds: u32) -> u64 {
    (u64::from(fps) * u64::from(segment_seconds)).max(1)
}

/// Substitute `{username}`, `{session}` and `{host}`. Any other `{name}`
/// group is rejected before anything is substituted.
pub fn apply_template(
    template: &str,
    identity: &Identity,
    label: &str,
) -> Result<String, InvocationError> {
    for token in template_tokens(template) {
        if identity.token(token).is_none() {
            return Err(InvocationError::BadTemplate {
                label: label.to_string(),
                token: token.to_string(),
            });
        }
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}').map(|c| open + c) else {
            break;
        };
        out.push_str(&rest[..open]);
        let name = &rest[open + 1..close];
        // Validated above
        out.push_str(identity.token(name).unwrap_or_default());
        rest = &rest[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Names of every `{...}` group in a template
fn template_tokens(template: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}').map(|c| open + c) else {
            break;
        };
        tokens.push(&rest[open + 1..close]);
        rest = &rest[close + 1..];
    }
    tokens
}

fn filter_graph(topology: &Topology, fps: u32) -> String {
    if topology.len() == 1 {
        return format!(
            "[0:v]fps={},format=yuv420p,scale=trunc(iw/2)*2:trunc(ih/2)*2[final]",
            fps
        );
    }

    let (min_x, min_y) = topology.origin();
    let inputs: String = (0..topology.len()).map(|i| format!("[{}:v]", i)).collect();
    let layout = topology
        .monitors()
        .iter()
        .map(|m| format!("{}_{}", m.left - min_x, m.top - min_y))
        .collect::<Vec<_>>()
        .join("|");

    format!(
        "{inputs}xstack=inputs={n}:layout={layout}:fill=black[stack];\
         [stack]pad=ceil(iw/2)*2:ceil(ih/2)*2[stackp];\
         [stackp]fps={fps}[stackf];\
         [stackf]format=yuv420p[final]",
        n = topology.len(),
    )
}

fn encoder_args(encoder: Encoder, crf: u32) -> Vec<String> {
    match encoder {
        Encoder::Libx264 => {
            let mut args = strings(&["-c:v", "libx264", "-preset", "veryfast", "-crf"]);
            args.push(crf.to_string());
            args.extend(strings(&["-pix_fmt", "yuv420p"]));
            args
        }
        Encoder::H264Nvenc => strings(&[
            "-c:v", "h264_nvenc", "-preset", "fast", "-b:v", "4M", "-maxrate", "5M", "-bufsize",
            "10M", "-pix_fmt", "yuv420p",
        ]),
        Encoder::H264Qsv => strings(&[
            "-c:v", "h264_qsv", "-preset", "veryfast", "-b:v", "4M", "-pix_fmt", "yuv420p",
        ]),
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::topology::Monitor;

    fn identity() -> Identity {
        Identity::new("alice", "desk-01", "2")
    }

    fn config() -> RecorderConfig {
        RecorderConfig {
            record_dir: PathBuf::from("/rec"),
            fps: 10,
            segment_seconds: 60,
            ffmpeg_path: PathBuf::from("/opt/ffmpeg"),
            ..RecorderConfig::default()
        }
    }

    fn single() -> Topology {
        Topology::new(vec![Monitor::new(0, 0, 1920, 1080)])
    }

    fn count(args: &[String], flag: &str) -> usize {
        args.iter().filter(|a| *a == flag).count()
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> &'a str {
        let idx = args.iter().position(|a| a == flag).expect("flag present");
        &args[idx + 1]
    }

    #[test]
    fn same_inputs_same_spec() {
        let cfg = config();
        let topo = Topology::new(vec![
            Monitor::new(1920, 0, 1280, 1024),
            Monitor::new(0, 0, 1920, 1080),
        ]);
        let a = build_invocation(&cfg, &topo, &identity(), &CaptureBackend::GdiGrab).unwrap();
        let b = build_invocation(&cfg, &topo, &identity(), &CaptureBackend::GdiGrab).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }

    #[test]
    fn single_monitor_has_one_input_and_no_tiling() {
        let spec =
            build_invocation(&config(), &single(), &identity(), &CaptureBackend::GdiGrab).unwrap();
        assert_eq!(count(&spec.args, "-i"), 1);
        let filter = value_after(&spec.args, "-filter_complex");
        assert!(!filter.contains("xstack"));
        assert_eq!(
            filter,
            "[0:v]fps=10,format=yuv420p,scale=trunc(iw/2)*2:trunc(ih/2)*2[final]"
        );
        assert_eq!(value_after(&spec.args, "-video_size"), "1920x1080");
        assert_eq!(value_after(&spec.args, "-offset_x"), "0");
    }

    #[test]
    fn multi_monitor_tiles_relative_to_origin() {
        let topo = Topology::new(vec![
            Monitor::new(0, 0, 1920, 1080),
            Monitor::new(-1280, 100, 1280, 1024),
            Monitor::new(1920, -200, 1080, 1920),
        ]);
        let spec =
            build_invocation(&config(), &topo, &identity(), &CaptureBackend::GdiGrab).unwrap();
        assert_eq!(count(&spec.args, "-i"), 3);
        let filter = value_after(&spec.args, "-filter_complex");
        assert!(filter.starts_with("[0:v][1:v][2:v]xstack=inputs=3:layout=0_300|1280_200|3200_0:fill=black[stack];"));
        assert!(filter.contains("[stack]pad=ceil(iw/2)*2:ceil(ih/2)*2[stackp]"));
        assert!(filter.ends_with("[stackf]format=yuv420p[final]"));
    }

    #[test]
    fn x11_inputs_carry_offsets_in_the_display_string() {
        let topo = Topology::new(vec![
            Monitor::new(0, 0, 1920, 1080),
            Monitor::new(1920, 0, 1280, 1024),
        ]);
        let backend = CaptureBackend::X11Grab {
            display: ":1".to_string(),
        };
        let spec = build_invocation(&config(), &topo, &identity(), &backend).unwrap();
        let inputs: Vec<_> = spec
            .args
            .iter()
            .enumerate()
            .filter(|(_, a)| *a == "-i")
            .map(|(i, _)| spec.args[i + 1].as_str())
            .collect();
        assert_eq!(inputs, vec![":1+0,0", ":1+1920,0"]);
        assert_eq!(count(&spec.args, "x11grab"), 2);
        assert_eq!(count(&spec.args, "-offset_x"), 0);
    }

    #[test]
    fn empty_topology_fails() {
        let err = build_invocation(
            &config(),
            &Topology::default(),
            &identity(),
            &CaptureBackend::GdiGrab,
        )
        .unwrap_err();
        assert_eq!(err, InvocationError::NoMonitors);
    }

    #[test]
    fn tokens_substitute_into_paths() {
        let mut cfg = config();
        cfg.subdir_template = "{username}/{host}/s{session}".to_string();
        cfg.output_pattern = "{host}_%Y%m%d.mkv".to_string();
        let spec = build_invocation(&cfg, &single(), &identity(), &CaptureBackend::GdiGrab).unwrap();
        assert_eq!(spec.output_dir, PathBuf::from("/rec/alice/desk-01/s2"));
        assert_eq!(
            spec.output_path,
            PathBuf::from("/rec/alice/desk-01/s2/desk-01_%Y%m%d.mkv")
        );
        assert_eq!(
            spec.args.last().map(String::as_str),
            Some(spec.output_path.to_string_lossy().as_ref())
        );
    }

    #[test]
    fn unknown_token_names_the_template() {
        let mut cfg = config();
        cfg.subdir_template = "{username}/{bogus}".to_string();
        let err = build_invocation(&cfg, &single(), &identity(), &CaptureBackend::GdiGrab)
            .unwrap_err();
        assert_eq!(
            err,
            InvocationError::BadTemplate {
                label: "record_subdir_template".to_string(),
                token: "bogus".to_string(),
            }
        );

        let mut cfg = config();
        cfg.output_pattern = "{user}.mkv".to_string();
        let err = build_invocation(&cfg, &single(), &identity(), &CaptureBackend::GdiGrab)
            .unwrap_err();
        assert!(err.to_string().contains("output_pattern"));
    }

    #[test]
    fn substitution_does_not_rescan_values() {
        let id = Identity::new("{host}", "box", "1");
        assert_eq!(apply_template("{username}", &id, "t").unwrap(), "{host}");
    }

    #[test]
    fn blank_subdir_and_pattern_fall_back() {
        let mut cfg = config();
        cfg.subdir_template = "  ".to_string();
        cfg.output_pattern = String::new();
        let spec = build_invocation(&cfg, &single(), &identity(), &CaptureBackend::GdiGrab).unwrap();
        assert_eq!(spec.output_dir, PathBuf::from("/rec"));
        assert_eq!(spec.output_path, PathBuf::from("/rec").join(DEFAULT_OUTPUT_PATTERN));
    }

    #[test]
    fn gop_matches_fps_times_segment() {
        for (fps, seg) in [(1, 1), (12, 3600), (30, 10), (60, 7)] {
            let cfg = RecorderConfig {
                fps,
                segment_seconds: seg,
                ..config()
            };
            let spec =
                build_invocation(&cfg, &single(), &identity(), &CaptureBackend::GdiGrab).unwrap();
            assert_eq!(
                value_after(&spec.args, "-g"),
                (u64::from(fps) * u64::from(seg)).to_string()
            );
            assert_eq!(value_after(&spec.args, "-segment_time"), seg.to_string());
        }
    }

    #[test]
    fn encoder_selection() {
        let cases = [
            ("auto", "libx264"),
            ("libx264", "libx264"),
            ("h264_nvenc", "h264_nvenc"),
            ("h264_qsv", "h264_qsv"),
            ("something-else", "libx264"),
        ];
        for (name, codec) in cases {
            let cfg = RecorderConfig {
                encoder_name: name.to_string(),
                crf: 23,
                ..config()
            };
            let spec =
                build_invocation(&cfg, &single(), &identity(), &CaptureBackend::GdiGrab).unwrap();
            assert_eq!(value_after(&spec.args, "-c:v"), codec);
            if codec == "libx264" {
                assert_eq!(value_after(&spec.args, "-crf"), "23");
            }
        }
    }

    #[test]
    fn verbose_raises_encoder_log_level() {
        let mut cfg = config();
        let spec = build_invocation(&cfg, &single(), &identity(), &CaptureBackend::GdiGrab).unwrap();
        assert_eq!(value_after(&spec.args, "-loglevel"), "warning");
        cfg.verbose = true;
        let spec = build_invocation(&cfg, &single(), &identity(), &CaptureBackend::GdiGrab).unwrap();
        assert_eq!(value_after(&spec.args, "-loglevel"), "info");
    }
}
