use std::ffi::CString;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{PrexdError, Result};
use crate::lang::Lang;

/// Resolved execution capability for one language: where the interpreter
/// lives and how to shape its argv. Java is the only variant with a
/// distinct argv (classpath + fixed class name); everything else shares
/// the script-driver shape.
#[derive(Debug, Clone)]
pub struct LangRuntime {
    pub lang: Lang,
    pub exe_path: PathBuf,
    pub node_path: PathBuf,
}

impl LangRuntime {
    pub fn resolve(lang: Lang, config: &Config, exe_dir: &Path) -> Result<Self> {
        let exe_path = config.interpreter_path(lang).to_path_buf();
        if !exe_path.exists() {
            return Err(PrexdError::LanguageNotSupported(lang.to_string()));
        }
        Ok(Self {
            lang,
            exe_path,
            node_path: exe_dir.join(lang.node_script()),
        })
    }

    /// Argv handed to exec. The driver script receives the FIFO paths, the
    /// script length and the task coordinates as positional arguments.
    pub fn argv(
        &self,
        read_fifo: &Path,
        write_fifo: &Path,
        script_len: u32,
        task_id: u32,
        num_tasks: u32,
    ) -> Result<Vec<CString>> {
        let mut argv = vec![cstring(self.lang.config_key())?];
        if self.lang == Lang::Java {
            argv.push(cstring("-cp")?);
            argv.push(cstring(&self.node_path.to_string_lossy())?);
            argv.push(cstring("node")?);
        } else {
            argv.push(cstring(&self.node_path.to_string_lossy())?);
        }
        argv.push(cstring(&read_fifo.to_string_lossy())?);
        argv.push(cstring(&write_fifo.to_string_lossy())?);
        argv.push(cstring(&script_len.to_string())?);
        argv.push(cstring(&task_id.to_string())?);
        argv.push(cstring(&num_tasks.to_string())?);
        Ok(argv)
    }

    pub fn exe_cstring(&self) -> Result<CString> {
        cstring(&self.exe_path.to_string_lossy())
    }
}

fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| PrexdError::MalformedPayload("NUL in exec argument".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(lang: Lang) -> LangRuntime {
        LangRuntime {
            lang,
            exe_path: "/usr/bin/env".into(),
            node_path: Path::new("/opt/prexd").join(lang.node_script()),
        }
    }

    fn argv_strings(runtime: &LangRuntime) -> Vec<String> {
        runtime
            .argv(
                Path::new("/tmp/.prexecr0"),
                Path::new("/tmp/.prexecw0"),
                9,
                1,
                4,
            )
            .unwrap()
            .into_iter()
            .map(|arg| arg.into_string().unwrap())
            .collect()
    }

    #[test]
    fn script_languages_share_one_argv_shape() {
        let argv = argv_strings(&runtime(Lang::Python));
        assert_eq!(
            argv,
            vec![
                "python",
                "/opt/prexd/node/node.py",
                "/tmp/.prexecr0",
                "/tmp/.prexecw0",
                "9",
                "1",
                "4",
            ]
        );
    }

    #[test]
    fn java_argv_uses_classpath() {
        let argv = argv_strings(&runtime(Lang::Java));
        assert_eq!(
            argv,
            vec![
                "java",
                "-cp",
                "/opt/prexd/node",
                "node",
                "/tmp/.prexecr0",
                "/tmp/.prexecw0",
                "9",
                "1",
                "4",
            ]
        );
    }

    #[test]
    fn missing_interpreter_is_unsupported() {
        let config = Config::default();
        let mut bad = config.clone();
        bad.interpreters.ruby = "/nonexistent/ruby".into();
        assert!(matches!(
            LangRuntime::resolve(Lang::Ruby, &bad, Path::new("/opt/prexd")),
            Err(PrexdError::LanguageNotSupported(_))
        ));
    }
}
