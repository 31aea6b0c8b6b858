//! ExecHandler: внешняя программа как обработчик (CGI-подобно).
//!
//! PARAMS -> окружение процесса (окружение сервера не наследуется, кроме PATH),
//! STDIN запроса -> stdin программы, stdout программы -> ответ, stderr -> STDERR запроса.
//! Код выхода -> app_status; смерть по сигналу -> ошибка.

use anyhow::{anyhow, Context, Result};
use log::debug;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use super::{Handler, RequestHandle};

#[derive(Debug, Clone)]
pub struct ExecHandler {
    program: PathBuf,
}

impl ExecHandler {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Handler for ExecHandler {
    fn handle(&self, req: &mut dyn RequestHandle) -> Result<u32> {
        let body = req.read_body()?;

        let mut cmd = Command::new(&self.program);
        cmd.env_clear();
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        cmd.env("GATEWAY_INTERFACE", "CGI/1.1");
        for (k, v) in req.params() {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn handler {}", self.program.display()))?;

        // stdin пишем из отдельного потока, иначе большой ответ заблокирует pipe
        let feeder = child.stdin.take().map(|mut stdin| {
            std::thread::spawn(move || {
                let _ = stdin.write_all(&body);
            })
        });

        let output = child
            .wait_with_output()
            .with_context(|| format!("wait handler {}", self.program.display()))?;
        if let Some(f) = feeder {
            let _ = f.join();
        }

        if !output.stdout.is_empty() {
            req.write_response(&output.stdout)?;
        }
        if !output.stderr.is_empty() {
            req.write_error(&output.stderr)?;
        }

        debug!(
            "exec {}: status={:?} out={}B err={}B",
            self.program.display(),
            output.status.code(),
            output.stdout.len(),
            output.stderr.len()
        );

        app_status(&self.program, output.status.code())
    }
}

/// Код выхода -> app_status. Отрицательный код (не-unix) и сигнал - ошибка.
fn app_status(program: &Path, code: Option<i32>) -> Result<u32> {
    match code {
        Some(code) => u32::try_from(code).map_err(|_| {
            anyhow!(
                "handler {} exited with negative code {}",
                program.display(),
                code
            )
        }),
        None => Err(anyhow!("handler {} terminated by signal", program.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_maps_to_app_status() {
        let p = Path::new("/bin/handler");
        assert_eq!(app_status(p, Some(0)).unwrap(), 0);
        assert_eq!(app_status(p, Some(3)).unwrap(), 3);
        assert!(app_status(p, Some(-1)).is_err());
        assert!(app_status(p, None).is_err());
    }
}
