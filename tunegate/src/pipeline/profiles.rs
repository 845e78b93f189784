//! Transcoding profiles.
//!
//! A profile maps a stable id to the FFmpeg argument vector that turns the
//! receiver's raw TS into HLS. The registry is static configuration loaded
//! at startup; session records store only the id.

use std::collections::HashMap;
use std::path::Path;

/// Placeholder for the resolved input stream URL.
const INPUT: &str = "{input}";
/// Placeholder for the session's HLS output directory.
const OUTPUT_DIR: &str = "{output_dir}";

/// A named transcoding preset.
#[derive(Debug, Clone)]
pub struct Profile {
    pub id: String,
    pub description: String,
    /// Argument template; `{input}` and `{output_dir}` are substituted.
    pub args: Vec<String>,
    /// Playlist filename the pipeline writes under the output directory.
    pub playlist_name: String,
}

impl Profile {
    /// Materialize the argument vector for one session.
    pub fn build_args(&self, input_url: &str, output_dir: &Path) -> Vec<String> {
        let dir = output_dir.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace(INPUT, input_url).replace(OUTPUT_DIR, &dir))
            .collect()
    }
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Static id → profile map.
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    profiles: HashMap<String, Profile>,
}

impl ProfileRegistry {
    /// The built-in profile set.
    pub fn builtin() -> Self {
        let mut registry = Self {
            profiles: HashMap::new(),
        };

        registry.insert(Profile {
            id: "hls_720p".into(),
            description: "H.264 720p / AAC, 4s MPEG-TS segments".into(),
            args: args(&[
                "-hide_banner",
                "-nostdin",
                "-y",
                "-i", "{input}",
                "-map", "0:v:0",
                "-map", "0:a:0",
                "-c:v", "libx264",
                "-preset", "veryfast",
                "-b:v", "2800k",
                "-maxrate", "3200k",
                "-bufsize", "5600k",
                "-s", "1280x720",
                "-c:a", "aac",
                "-b:a", "128k",
                "-ac", "2",
                "-f", "hls",
                "-hls_time", "4",
                "-hls_list_size", "6",
                "-hls_flags", "delete_segments+independent_segments",
                "-hls_segment_filename", "{output_dir}/seg-%05d.ts",
                "{output_dir}/index.m3u8",
            ]),
            playlist_name: "index.m3u8".into(),
        });

        registry.insert(Profile {
            id: "safari_fmp4".into(),
            description: "H.264 720p / AAC in fragmented MP4 for Safari".into(),
            args: args(&[
                "-hide_banner",
                "-nostdin",
                "-y",
                "-i", "{input}",
                "-map", "0:v:0",
                "-map", "0:a:0",
                "-c:v", "libx264",
                "-preset", "veryfast",
                "-b:v", "2800k",
                "-maxrate", "3200k",
                "-bufsize", "5600k",
                "-s", "1280x720",
                "-c:a", "aac",
                "-b:a", "128k",
                "-ac", "2",
                "-f", "hls",
                "-hls_time", "4",
                "-hls_list_size", "6",
                "-hls_segment_type", "fmp4",
                "-hls_fmp4_init_filename", "init.mp4",
                "-hls_flags", "delete_segments+independent_segments",
                "-hls_segment_filename", "{output_dir}/seg-%05d.m4s",
                "{output_dir}/index.m3u8",
            ]),
            playlist_name: "index.m3u8".into(),
        });

        registry.insert(Profile {
            id: "web_conservative".into(),
            description: "H.264 540p / AAC at low bitrate, 6s segments".into(),
            args: args(&[
                "-hide_banner",
                "-nostdin",
                "-y",
                "-i", "{input}",
                "-map", "0:v:0",
                "-map", "0:a:0",
                "-c:v", "libx264",
                "-preset", "veryfast",
                "-b:v", "1400k",
                "-maxrate", "1600k",
                "-bufsize", "2800k",
                "-s", "960x540",
                "-c:a", "aac",
                "-b:a", "96k",
                "-ac", "2",
                "-f", "hls",
                "-hls_time", "6",
                "-hls_list_size", "6",
                "-hls_flags", "delete_segments+independent_segments",
                "-hls_segment_filename", "{output_dir}/seg-%05d.ts",
                "{output_dir}/index.m3u8",
            ]),
            playlist_name: "index.m3u8".into(),
        });

        registry
    }

    fn insert(&mut self, profile: Profile) {
        self.profiles.insert(profile.id.clone(), profile);
    }

    pub fn get(&self, id: &str) -> Option<&Profile> {
        self.profiles.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.profiles.contains_key(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_profiles_are_present() {
        let registry = ProfileRegistry::builtin();
        assert_eq!(registry.ids(), vec!["hls_720p", "safari_fmp4", "web_conservative"]);
        assert!(registry.contains("hls_720p"));
        assert!(!registry.contains("hls_4k"));
    }

    #[test]
    fn build_args_substitutes_all_placeholders() {
        let registry = ProfileRegistry::builtin();
        let profile = registry.get("hls_720p").unwrap();
        let built = profile.build_args("http://box:8001/ref", Path::new("/var/hls/abc"));

        assert!(built.iter().any(|a| a == "http://box:8001/ref"));
        assert_eq!(built.last().unwrap(), "/var/hls/abc/index.m3u8");
        assert!(built.iter().all(|a| !a.contains("{input}")));
        assert!(built.iter().all(|a| !a.contains("{output_dir}")));
    }

    #[test]
    fn fmp4_profile_writes_m4s_segments() {
        let registry = ProfileRegistry::builtin();
        let profile = registry.get("safari_fmp4").unwrap();
        let built = profile.build_args("http://box:8001/ref", Path::new("/out"));
        assert!(built.iter().any(|a| a == "/out/seg-%05d.m4s"));
    }
}
