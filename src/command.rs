/// Transcoder invocation: ffmpeg base args + a profile template + the endpoint.
///
/// The relay core treats the result as an opaque argument vector.
use crate::config::EncoderConfig;
use serde::Deserialize;

/// Input side: read the raw stream from stdin, stay quiet, overwrite output.
const BASE_ARGS: &[&str] = &[
    "-hide_banner",
    "-loglevel",
    "panic",
    "-nostats",
    "-y",
    "-strict",
    "-2",
    "-threads",
    "0",
    "-i",
    "pipe:0",
];

const TWITCH_TEMPLATE: &[&str] = &[
    "-vf",
    "scale={scale},fps=fps={framerate}",
    "-vcodec",
    "libx264",
    "-g",
    "{framerate_dbl}",
    "-keyint_min",
    "{framerate}",
    "-bufsize",
    "10m",
    "-preset",
    "veryfast",
    "-b:v",
    "{bitrate}k",
    "-maxrate",
    "{bitrate}k",
    "-pix_fmt",
    "yuv420p",
    "-codec:a",
    "aac",
    "-b:a",
    "128k",
    "-ar",
    "44100",
    "-ac",
    "2",
    "-f",
    "flv",
];

/// Output profile selecting the encoder template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Twitch,
    Youtube,
}

impl Profile {
    fn template(self) -> &'static [&'static str] {
        match self {
            Profile::Twitch => TWITCH_TEMPLATE,
            // TODO: tune a dedicated YouTube ingest template (keyframe interval, audio rate)
            Profile::Youtube => TWITCH_TEMPLATE,
        }
    }
}

/// Substitute `{scale}`, `{framerate}`, `{framerate_dbl}`, and `{bitrate}` in one argument.
fn render_arg(arg: &str, encoder: &EncoderConfig) -> String {
    arg.replace("{framerate_dbl}", &(u64::from(encoder.framerate) * 2).to_string())
        .replace("{framerate}", &encoder.framerate.to_string())
        .replace("{bitrate}", &encoder.bitrate.to_string())
        .replace("{scale}", &encoder.scale)
}

/// Build the full transcoder command line: program first, endpoint last.
pub fn build_command(encoder: &EncoderConfig) -> Vec<String> {
    if !encoder.endpoint.to_lowercase().starts_with("rtmp") {
        tracing::warn!(
            endpoint = %encoder.endpoint,
            "streaming endpoint does not look like an RTMP URL"
        );
    }

    let mut cmd = Vec::with_capacity(2 + BASE_ARGS.len() + encoder.profile.template().len());
    cmd.push(encoder.ffmpeg.clone());
    cmd.extend(BASE_ARGS.iter().map(|a| a.to_string()));
    cmd.extend(
        encoder
            .profile
            .template()
            .iter()
            .map(|a| render_arg(a, encoder)),
    );
    cmd.push(encoder.endpoint.clone());

    tracing::debug!(command = %cmd.join(" "), "built transcoder command");
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder() -> EncoderConfig {
        EncoderConfig {
            endpoint: "rtmp://live.twitch.tv/app/key".to_string(),
            ..Default::default()
        }
    }

    fn value_after<'a>(cmd: &'a [String], flag: &str) -> &'a str {
        let idx = cmd.iter().position(|a| a == flag).unwrap();
        &cmd[idx + 1]
    }

    #[test]
    fn test_program_first_endpoint_last() {
        let cmd = build_command(&encoder());
        assert_eq!(cmd.first().unwrap(), "ffmpeg");
        assert_eq!(cmd.last().unwrap(), "rtmp://live.twitch.tv/app/key");
    }

    #[test]
    fn test_reads_from_stdin() {
        let cmd = build_command(&encoder());
        assert_eq!(value_after(&cmd, "-i"), "pipe:0");
        assert_eq!(value_after(&cmd, "-loglevel"), "panic");
    }

    #[test]
    fn test_placeholders_substituted() {
        let mut enc = encoder();
        enc.bitrate = 3500;
        enc.framerate = 30;
        enc.scale = "1280:720".to_string();
        let cmd = build_command(&enc);

        assert_eq!(value_after(&cmd, "-vf"), "scale=1280:720,fps=fps=30");
        assert_eq!(value_after(&cmd, "-g"), "60");
        assert_eq!(value_after(&cmd, "-keyint_min"), "30");
        assert_eq!(value_after(&cmd, "-b:v"), "3500k");
        assert_eq!(value_after(&cmd, "-maxrate"), "3500k");
        assert!(cmd.iter().all(|a| !a.contains('{')));
    }

    #[test]
    fn test_custom_ffmpeg_path() {
        let mut enc = encoder();
        enc.ffmpeg = "/opt/ffmpeg/bin/ffmpeg".to_string();
        let cmd = build_command(&enc);
        assert_eq!(cmd[0], "/opt/ffmpeg/bin/ffmpeg");
    }

    #[test]
    fn test_scale_with_spaces_stays_one_argument() {
        let mut enc = encoder();
        enc.scale = "iw/2:ih / 2".to_string();
        let cmd = build_command(&enc);
        assert_eq!(value_after(&cmd, "-vf"), "scale=iw/2:ih / 2,fps=fps=60");
    }

    #[test]
    fn test_youtube_uses_twitch_template() {
        let twitch = build_command(&encoder());
        let mut enc = encoder();
        enc.profile = Profile::Youtube;
        assert_eq!(build_command(&enc), twitch);
    }

    #[test]
    fn test_non_rtmp_endpoint_still_builds() {
        let cmd = build_command(&EncoderConfig::default());
        assert_eq!(cmd.last().unwrap(), "/dev/null");
    }
}
