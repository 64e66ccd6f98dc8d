//! Live per-host output view
//!
//! Each frame is one underlined header per host (green while running or
//! after success, red after failure) followed by the host's last lines, or
//! its error. On a terminal the previous frame is erased before the next
//! one is drawn; otherwise only the final frame is written.

use std::io::{self, IsTerminal, Write};
use std::sync::Arc;
use std::time::Duration;

use crossterm::style::Stylize;
use crossterm::{cursor, queue, terminal};
use tokio::sync::{oneshot, Notify};
use tracing::debug;

use super::job::{Job, JobReport, TAIL_LINES};

/// Minimum time between two frames
pub const RENDER_INTERVAL: Duration = Duration::from_millis(50);

pub struct Renderer {
    out: Box<dyn Write + Send>,
    signal: Arc<Notify>,
    /// Rewind and redraw frames in place
    live: bool,
    color: bool,
    /// Rows drawn by the previous frame
    drawn: usize,
}

impl Renderer {
    /// Renderer on stdout, live and colored when stdout is a terminal
    pub fn stdout(signal: Arc<Notify>) -> Self {
        let tty = io::stdout().is_terminal();
        Self::new(Box::new(io::stdout()), signal, tty)
    }

    pub fn new(out: Box<dyn Write + Send>, signal: Arc<Notify>, live: bool) -> Self {
        Self {
            out,
            signal,
            live,
            color: live,
            drawn: 0,
        }
    }

    /// Redraw on every job signal until `shutdown` fires, then draw the
    /// final frame.
    pub async fn run(
        mut self,
        jobs: Vec<Arc<Job>>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> io::Result<()> {
        loop {
            tokio::select! {
                _ = self.signal.notified() => {}
                _ = &mut shutdown => break,
            }

            if self.live {
                self.draw(&jobs)?;
            }
            tokio::time::sleep(RENDER_INTERVAL).await;
        }

        self.draw(&jobs)?;
        debug!("Final frame drawn ({} rows)", self.drawn);
        Ok(())
    }

    /// Draw one frame, erasing the previous one when live
    pub fn draw(&mut self, jobs: &[Arc<Job>]) -> io::Result<()> {
        let reports: Vec<JobReport> = jobs.iter().map(|job| job.snapshot()).collect();
        let width = if self.live {
            terminal::size().ok().map(|(cols, _)| cols as usize)
        } else {
            None
        };
        let rows = render_frame(&reports, self.color, width);

        if self.live && self.drawn > 0 {
            let up = u16::try_from(self.drawn).unwrap_or(u16::MAX);
            queue!(
                self.out,
                cursor::MoveToColumn(0),
                cursor::MoveUp(up),
                terminal::Clear(terminal::ClearType::FromCursorDown)
            )?;
        }

        for row in &rows {
            writeln!(self.out, "{}", row)?;
        }
        self.out.flush()?;
        self.drawn = rows.len();
        Ok(())
    }
}

/// Rows of one frame. Lines longer than `width` are cut so every row
/// occupies exactly one terminal line.
pub fn render_frame(reports: &[JobReport], color: bool, width: Option<usize>) -> Vec<String> {
    let mut rows = Vec::new();

    for report in reports {
        rows.push(header(report, color));
        match &report.error {
            Some(error) => rows.extend(error.lines().map(str::to_string)),
            None => {
                let from = report.output.len().saturating_sub(TAIL_LINES);
                rows.extend(report.output[from..].iter().cloned());
            }
        }
    }

    if let Some(width) = width.filter(|w| *w > 0) {
        for row in rows.iter_mut().filter(|r| r.chars().count() > width) {
            *row = truncate(row, width);
        }
    }

    rows
}

fn header(report: &JobReport, color: bool) -> String {
    if !color {
        return report.host.clone();
    }
    let host = report.host.as_str().underlined();
    if report.error.is_some() {
        host.red().to_string()
    } else {
        host.green().to_string()
    }
}

// Headers carry escape codes, which are never cut
fn truncate(row: &str, width: usize) -> String {
    if row.contains('\x1b') {
        return row.to_string();
    }
    row.chars().take(width).collect()
}

/// Every job as one pretty-printed JSON document
pub fn write_json_report<W: Write>(jobs: &[Arc<Job>], out: &mut W) -> io::Result<()> {
    let reports: Vec<JobReport> = jobs.iter().map(|job| job.snapshot()).collect();
    serde_json::to_writer_pretty(&mut *out, &reports)?;
    writeln!(out)?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::SessionPhase;
    use parking_lot::Mutex;

    /// Cloneable in-memory output
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().clone()).unwrap()
        }
    }

    fn report(host: &str, output: &[&str], error: Option<&str>) -> JobReport {
        JobReport {
            host: host.to_string(),
            phase: if error.is_some() {
                SessionPhase::Failed
            } else {
                SessionPhase::Closed
            },
            success: error.is_none(),
            error: error.map(str::to_string),
            output: output.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn job_with_lines(host: &str, lines: &[&str], signal: &Arc<Notify>) -> Arc<Job> {
        let options = crate::ssh::EffectiveOptions {
            alias: host.to_string(),
            host: host.to_string(),
            port: "22".to_string(),
            user: "deploy".to_string(),
            identity_file: None,
            forward_agent: None,
            proxy_command: None,
            connect_timeout: None,
            strict_host_key_checking: Default::default(),
            user_known_hosts_file: None,
        };
        let job = Arc::new(Job::new(host, Ok(options), signal.clone()));
        for line in lines {
            job.push_line(line.to_string());
        }
        job
    }

    #[test]
    fn test_frame_shows_tail_or_error() {
        let reports = [
            report("web1", &["1", "2", "3", "4", "5", "6", "7"], None),
            report("web2", &["partial"], Some(crate::ssh::AUTH_EXHAUSTED)),
        ];

        let rows = render_frame(&reports, false, None);
        assert_eq!(
            rows,
            [
                "web1",
                "3",
                "4",
                "5",
                "6",
                "7",
                "web2",
                "none of the provided authentication methods can establish SSH session successfully",
            ]
        );
    }

    #[test]
    fn test_headers_are_styled() {
        let rows = render_frame(
            &[report("ok", &[], None), report("bad", &[], Some("boom"))],
            true,
            None,
        );
        assert!(rows[0].contains("ok") && rows[0].contains("\x1b[4m"));
        assert!(rows[1].contains("bad") && rows[1].contains("\x1b[4m"));
        assert_eq!(rows[2], "boom");
    }

    #[test]
    fn test_long_lines_are_cut_to_width() {
        let rows = render_frame(&[report("h", &["abcdefghij"], None)], false, Some(4));
        assert_eq!(rows, ["h", "abcd"]);
    }

    #[test]
    fn test_non_live_renderer_prints_plain_frames() {
        let signal = Arc::new(Notify::new());
        let jobs = vec![job_with_lines("db", &["up 3 days"], &signal)];
        let buf = SharedBuf::default();

        let mut renderer = Renderer::new(Box::new(buf.clone()), signal, false);
        renderer.draw(&jobs).unwrap();
        assert_eq!(buf.text(), "db\nup 3 days\n");
    }

    #[test]
    fn test_live_renderer_rewinds_previous_frame() {
        let signal = Arc::new(Notify::new());
        let jobs = vec![job_with_lines("db", &["one"], &signal)];
        let buf = SharedBuf::default();

        let mut renderer = Renderer::new(Box::new(buf.clone()), signal, true);
        renderer.draw(&jobs).unwrap();
        let first = buf.text();
        assert!(!first.contains("\x1b[2A"));

        jobs[0].push_line("two".to_string());
        renderer.draw(&jobs).unwrap();
        let all = buf.text();
        // Two rows drawn before, so the cursor moves up two lines
        assert!(all[first.len()..].contains("\x1b[2A"));
        assert!(all.ends_with("two\n"));
    }

    #[tokio::test]
    async fn test_run_draws_final_frame_on_shutdown() {
        let signal = Arc::new(Notify::new());
        let jobs = vec![job_with_lines("db", &["done"], &signal)];
        let buf = SharedBuf::default();
        let renderer = Renderer::new(Box::new(buf.clone()), signal, false);

        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(renderer.run(jobs, rx));
        tx.send(()).unwrap();
        task.await.unwrap().unwrap();

        // Not live: exactly one frame
        assert_eq!(buf.text(), "db\ndone\n");
    }

    #[test]
    fn test_json_report() {
        let signal = Arc::new(Notify::new());
        let jobs = vec![job_with_lines("db", &["a", "b"], &signal)];
        jobs[0].finish(Ok(()));

        let mut out = Vec::new();
        write_json_report(&jobs, &mut out).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();

        assert_eq!(value[0]["host"], "db");
        assert_eq!(value[0]["success"], true);
        assert_eq!(value[0]["phase"], "closed");
        assert_eq!(value[0]["output"][1], "b");
        assert!(value[0]["error"].is_null());
    }
}
