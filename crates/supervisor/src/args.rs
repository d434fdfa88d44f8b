//! Command-line argument construction for the external render tool.
//!
//! `RenderSupervisor` depends on this trait object rather than a
//! hard-coded builder so a caller may supply their own; the
//! `DefaultArgBuilder` below implements the tool's stable
//! command-line grammar and is what the CLI wires up by default.

use renderfarm_core::RenderJob;

/// A pure function from a job record to an argument vector for the
/// external render tool.
pub trait ArgBuilder: Send + Sync {
    fn build(&self, job: &RenderJob, log_file: Option<&std::path::Path>) -> Vec<String>;
}

/// The render tool's flag grammar.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultArgBuilder;

impl ArgBuilder for DefaultArgBuilder {
    fn build(&self, job: &RenderJob, log_file: Option<&std::path::Path>) -> Vec<String> {
        let mut cmd = vec!["-r".to_string(), job.project_file.display().to_string()];

        if !job.format.is_empty() {
            cmd.push("-f".to_string());
            cmd.push(job.format.clone());
        }
        if !job.options.is_empty() {
            cmd.push("-options".to_string());
            cmd.push(job.options.clone());
        }
        if let Some(out) = &job.output_path {
            cmd.push("-o".to_string());
            cmd.push(out.display().to_string());
        }
        if let Some(start) = job.start_frame {
            cmd.push("-start".to_string());
            cmd.push(start.to_string());
        }
        if let Some(end) = job.end_frame {
            cmd.push("-end".to_string());
            cmd.push(end.to_string());
        }

        if job.verbose && !job.quiet {
            cmd.push("-v".to_string());
        }
        if job.quiet {
            cmd.push("-q".to_string());
        }

        let log_path = job.log_file.as_deref().or(log_file);
        if let Some(log_path) = log_path {
            cmd.push("-log".to_string());
            cmd.push(log_path.display().to_string());
        }

        push_bool_flag(&mut cmd, "-multithread", job.multithread);
        push_bool_flag(&mut cmd, "-halfsize", job.halfsize);
        push_bool_flag(&mut cmd, "-halffps", job.halffps);
        push_bool_flag(&mut cmd, "-shapefx", job.shapefx);
        push_bool_flag(&mut cmd, "-layerfx", job.layerfx);
        push_bool_flag(&mut cmd, "-fewparticles", job.fewparticles);
        push_bool_flag(&mut cmd, "-aa", job.aa);
        push_bool_flag(&mut cmd, "-extrasmooth", job.extrasmooth);
        push_bool_flag(&mut cmd, "-premultiply", job.premultiply);
        push_bool_flag(&mut cmd, "-ntscsafe", job.ntscsafe);
        push_bool_flag(&mut cmd, "-addformatsuffix", job.addformatsuffix);
        push_bool_flag(&mut cmd, "-addlayercompsuffix", job.addlayercompsuffix);
        push_bool_flag(
            &mut cmd,
            "-createfolderforlayercomps",
            job.createfolderforlayercomps,
        );

        if !job.layercomp.is_empty() {
            cmd.push("-layercomp".to_string());
            cmd.push(job.layercomp.clone());
        }
        if let Some(videocodec) = job.videocodec {
            cmd.push("-videocodec".to_string());
            cmd.push(videocodec.to_string());
        }
        if let Some(quality) = job.quality {
            cmd.push("-quality".to_string());
            cmd.push(quality.to_string());
        }
        if let Some(depth) = job.depth {
            cmd.push("-depth".to_string());
            cmd.push(depth.to_string());
        }

        cmd
    }
}

fn push_bool_flag(cmd: &mut Vec<String>, flag: &str, value: Option<bool>) {
    if let Some(value) = value {
        cmd.push(flag.to_string());
        cmd.push(if value { "yes" } else { "no" }.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_minimal_command_for_bare_job() {
        let job = RenderJob::new("/p.moho");
        let argv = DefaultArgBuilder.build(&job, None);
        assert_eq!(argv[0], "-r");
        assert_eq!(argv[1], "/p.moho");
        assert!(argv.contains(&"-f".to_string()));
        assert!(argv.contains(&"MP4".to_string()));
        assert!(argv.contains(&"-v".to_string()));
    }

    #[test]
    fn quiet_suppresses_verbose_flag() {
        let mut job = RenderJob::new("/p.moho");
        job.quiet = true;
        let argv = DefaultArgBuilder.build(&job, None);
        assert!(!argv.contains(&"-v".to_string()));
        assert!(argv.contains(&"-q".to_string()));
    }

    #[test]
    fn bool_flags_only_emitted_when_set() {
        let mut job = RenderJob::new("/p.moho");
        job.aa = Some(true);
        job.halfsize = Some(false);
        let argv = DefaultArgBuilder.build(&job, None);
        let aa_idx = argv.iter().position(|s| s == "-aa").unwrap();
        assert_eq!(argv[aa_idx + 1], "yes");
        let halfsize_idx = argv.iter().position(|s| s == "-halfsize").unwrap();
        assert_eq!(argv[halfsize_idx + 1], "no");
        assert!(!argv.contains(&"-shapefx".to_string()));
    }

    #[test]
    fn synthesized_log_path_used_when_job_has_none() {
        let job = RenderJob::new("/p.moho");
        let argv = DefaultArgBuilder.build(&job, Some(std::path::Path::new("/tmp/x.log")));
        let idx = argv.iter().position(|s| s == "-log").unwrap();
        assert_eq!(argv[idx + 1], "/tmp/x.log");
    }
}
