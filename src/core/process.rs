//! Archiver subprocess plumbing.
//!
//! Every external archiver and compressor is reached through one
//! abstraction: a spawned pipeline exposing a line reader over its listing
//! output and a mid-stream `terminate()`. Commands are built from discrete
//! argument vectors; nothing here goes through a shell.
//!
//! Streamed archives are shard-split in-process (`.tar.a`, `.tar.gz.a`, …)
//! instead of delegating to `split`, so the shard size is exact and the
//! writer can fsync what it wrote.

use crate::errors::{Result, StorageError};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::debug;

const IO_BUFFER: usize = 128 * 1024;

type LineReader = Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>;

/// A running archiver pipeline: one or two children, a line-oriented
/// progress stream, and at most one raw end (archive bytes in or out).
pub struct JobPipeline {
    label: &'static str,
    children: Vec<Child>,
    lines: LineReader,
    stdout: Option<ChildStdout>,
    stdin: Option<ChildStdin>,
}

impl JobPipeline {
    /// Next line of listing output; `None` at end of stream.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.lines.next_line().await
    }

    /// The archive byte stream of a pack pipeline.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// The archive byte sink of an unpack pipeline.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Cooperative mid-stream termination: kill the children and reap them.
    pub async fn terminate(&mut self) {
        debug!(tool = self.label, "terminating pipeline");
        for child in &mut self.children {
            let _ = child.start_kill();
        }
        for child in &mut self.children {
            let _ = child.wait().await;
        }
    }

    /// Reap the pipeline; any stage exiting nonzero fails the whole thing.
    pub async fn wait(&mut self) -> Result<()> {
        for child in &mut self.children {
            let status = child
                .wait()
                .await
                .map_err(|e| StorageError::encoding(self.label, e))?;
            if !status.success() {
                return Err(StorageError::encoding(self.label, status));
            }
        }
        Ok(())
    }
}

fn command(program: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.kill_on_drop(true);
    cmd
}

fn spawn(mut cmd: Command, label: &'static str) -> Result<Child> {
    cmd.spawn()
        .map_err(|e| StorageError::encoding(label, format!("failed to launch: {e}")))
}

fn boxed_lines(reader: impl AsyncRead + Send + Unpin + 'static) -> LineReader {
    let boxed: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
    BufReader::new(boxed).lines()
}

fn tar_create(source: &Path, excludes: &[String]) -> Command {
    let mut cmd = command("tar");
    cmd.arg("-cpv");
    for pattern in excludes {
        cmd.arg(format!("--exclude={pattern}"));
    }
    cmd.arg("-f").arg("-");
    if let Some(parent) = source.parent() {
        cmd.current_dir(parent);
    }
    cmd.arg(source.file_name().unwrap_or(source.as_os_str()));
    cmd
}

fn tar_extract(dest: &Path) -> Command {
    let mut cmd = command("tar");
    cmd.arg("-xpv").arg("-f").arg("-");
    if let Some(parent) = dest.parent() {
        cmd.current_dir(parent);
    }
    cmd
}

/// `tar -cpv` from the source's parent; archive bytes on `take_stdout`,
/// listing lines from stderr.
pub fn spawn_tar_pack(source: &Path, excludes: &[String]) -> Result<JobPipeline> {
    let mut cmd = tar_create(source, excludes);
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut tar = spawn(cmd, "tar")?;

    let stdout = tar.stdout.take();
    let lines = boxed_lines(tar.stderr.take().expect("piped stderr"));
    Ok(JobPipeline {
        label: "tar",
        children: vec![tar],
        lines,
        stdout,
        stdin: None,
    })
}

/// `tar -cpv | pigz -c`; compressed bytes on `take_stdout`, listing lines
/// from tar's stderr.
pub fn spawn_tar_gzip_pack(source: &Path, excludes: &[String]) -> Result<JobPipeline> {
    let mut cmd = tar_create(source, excludes);
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut tar = spawn(cmd, "tar")?;

    let tar_out: Stdio = tar
        .stdout
        .take()
        .expect("piped stdout")
        .try_into()
        .map_err(|e| StorageError::encoding("tar", format!("cannot chain stdout: {e}")))?;

    let mut gzip = command("pigz");
    gzip.arg("-c").stdin(tar_out).stdout(Stdio::piped());
    let mut pigz = spawn(gzip, "pigz")?;

    let stdout = pigz.stdout.take();
    let lines = boxed_lines(tar.stderr.take().expect("piped stderr"));
    Ok(JobPipeline {
        label: "tar|pigz",
        children: vec![tar, pigz],
        lines,
        stdout,
        stdin: None,
    })
}

/// `tar -xpv` into the destination's parent; archive bytes go to
/// `take_stdin`, listing lines come from tar's stdout.
pub fn spawn_tar_unpack(dest: &Path) -> Result<JobPipeline> {
    let mut cmd = tar_extract(dest);
    cmd.stdin(Stdio::piped()).stdout(Stdio::piped());
    let mut tar = spawn(cmd, "tar")?;

    let stdin = tar.stdin.take();
    let lines = boxed_lines(tar.stdout.take().expect("piped stdout"));
    Ok(JobPipeline {
        label: "tar",
        children: vec![tar],
        lines,
        stdout: None,
        stdin,
    })
}

/// `pigz -d -c | tar -xpv`; compressed bytes go to `take_stdin`.
pub fn spawn_tar_gzip_unpack(dest: &Path) -> Result<JobPipeline> {
    let mut gzip = command("pigz");
    gzip.arg("-d")
        .arg("-c")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped());
    let mut pigz = spawn(gzip, "pigz")?;

    let pigz_out: Stdio = pigz
        .stdout
        .take()
        .expect("piped stdout")
        .try_into()
        .map_err(|e| StorageError::encoding("pigz", format!("cannot chain stdout: {e}")))?;

    let mut cmd = tar_extract(dest);
    cmd.stdin(pigz_out).stdout(Stdio::piped());
    let mut tar = spawn(cmd, "tar")?;

    let stdin = pigz.stdin.take();
    let lines = boxed_lines(tar.stdout.take().expect("piped stdout"));
    Ok(JobPipeline {
        label: "pigz|tar",
        children: vec![pigz, tar],
        lines,
        stdout: None,
        stdin,
    })
}

/// `mkyaffs2image . <image>` inside the source directory.
pub fn spawn_flash_image_pack(source: &Path, image: &Path) -> Result<JobPipeline> {
    let mut cmd = command("mkyaffs2image");
    cmd.current_dir(source)
        .arg(".")
        .arg(image)
        .stdout(Stdio::piped());
    let mut child = spawn(cmd, "mkyaffs2image")?;

    let lines = boxed_lines(child.stdout.take().expect("piped stdout"));
    Ok(JobPipeline {
        label: "mkyaffs2image",
        children: vec![child],
        lines,
        stdout: None,
        stdin: None,
    })
}

/// `unyaffs <image>` inside the destination directory.
pub fn spawn_flash_image_unpack(image: &Path, dest: &Path) -> Result<JobPipeline> {
    let mut cmd = command("unyaffs");
    cmd.current_dir(dest).arg(image).stdout(Stdio::piped());
    let mut child = spawn(cmd, "unyaffs")?;

    let lines = boxed_lines(child.stdout.take().expect("piped stdout"));
    Ok(JobPipeline {
        label: "unyaffs",
        children: vec![child],
        lines,
        stdout: None,
        stdin: None,
    })
}

fn shard_path(base: &Path, index: usize) -> PathBuf {
    let suffix = (b'a' + index as u8) as char;
    PathBuf::from(format!("{}.{suffix}", base.display()))
}

/// Split `src` into `<base>.a`, `<base>.b`, … shards of at most `limit`
/// bytes. The first shard is always created, even for an empty stream.
pub async fn write_shards<R>(mut src: R, base: &Path, limit: u64) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut shard = 0usize;
    let mut out = tokio::fs::File::create(shard_path(base, shard)).await?;
    let mut in_shard = 0u64;
    let mut total = 0u64;
    let mut buf = vec![0u8; IO_BUFFER];

    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let mut offset = 0;
        while offset < n {
            if in_shard == limit {
                out.flush().await?;
                shard += 1;
                if shard >= 26 {
                    return Err(std::io::Error::other("archive exceeds shard suffix range"));
                }
                out = tokio::fs::File::create(shard_path(base, shard)).await?;
                in_shard = 0;
            }
            let take = ((limit - in_shard) as usize).min(n - offset);
            out.write_all(&buf[offset..offset + take]).await?;
            in_shard += take as u64;
            offset += take;
            total += take as u64;
        }
    }
    out.flush().await?;
    Ok(total)
}

/// All on-disk pieces of an archive, in read order: the exact base name
/// when present (un-sharded legacy layout), then `.a`, `.b`, … shards.
pub fn shard_files(base: &Path) -> Vec<PathBuf> {
    let Some(parent) = base.parent() else {
        return Vec::new();
    };
    let Some(stem) = base.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return Vec::new();
    };

    let mut files: Vec<PathBuf> = std::fs::read_dir(parent)
        .into_iter()
        .flatten()
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_shard = name.len() == stem.len() + 2
                && name.starts_with(&stem)
                && name.as_bytes()[stem.len()] == b'.'
                && name.as_bytes()[stem.len() + 1].is_ascii_lowercase();
            (name == stem || is_shard).then(|| entry.path())
        })
        .collect();
    files.sort();
    files
}

/// Stream every shard into `dst`, then close it so the reader sees EOF.
pub async fn feed_shards<W>(files: &[PathBuf], mut dst: W) -> std::io::Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    for file in files {
        let mut src = tokio::fs::File::open(file).await?;
        total += tokio::io::copy(&mut src, &mut dst).await?;
    }
    dst.shutdown().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shards_split_and_reassemble() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("data.ext4.tar");
        let payload: Vec<u8> = (0..100u8).cycle().take(2500).collect();

        let written = write_shards(payload.as_slice(), &base, 1000).await.unwrap();
        assert_eq!(written, 2500);

        let files = shard_files(&base);
        assert_eq!(
            files
                .iter()
                .map(|f| f.file_name().unwrap().to_string_lossy().into_owned())
                .collect::<Vec<_>>(),
            vec!["data.ext4.tar.a", "data.ext4.tar.b", "data.ext4.tar.c"]
        );

        let mut rebuilt = std::io::Cursor::new(Vec::new());
        let total = feed_shards(&files, &mut rebuilt).await.unwrap();
        assert_eq!(total, 2500);
        assert_eq!(rebuilt.into_inner(), payload);
    }

    #[tokio::test]
    async fn empty_stream_still_creates_first_shard() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("cache.ext4.tar");

        write_shards(&b""[..], &base, 1000).await.unwrap();
        assert_eq!(shard_files(&base).len(), 1);
    }

    #[tokio::test]
    async fn shard_listing_ignores_other_archives() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.ext4.tar"), b"legacy").unwrap();
        std::fs::write(dir.path().join("data.ext4.tar.a"), b"shard").unwrap();
        std::fs::write(dir.path().join("data.ext4.tar.gz.a"), b"other").unwrap();
        std::fs::write(dir.path().join("data.ext4.tar.az"), b"junk").unwrap();

        let files = shard_files(&dir.path().join("data.ext4.tar"));
        let names: Vec<_> = files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["data.ext4.tar", "data.ext4.tar.a"]);
    }

    #[tokio::test]
    async fn tar_round_trip_through_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("system");
        std::fs::create_dir_all(source.join("app")).unwrap();
        std::fs::write(source.join("app/one.apk"), b"first").unwrap();
        std::fs::write(source.join("build.prop"), b"ro.build=1").unwrap();

        let base = dir.path().join("system.ext4.tar");
        let mut pack = spawn_tar_pack(&source, &[]).unwrap();
        let stdout = pack.take_stdout().unwrap();

        let (written, lines) = tokio::join!(write_shards(stdout, &base, 1_000_000_000), async {
            let mut seen = 0usize;
            while let Ok(Some(_)) = pack.next_line().await {
                seen += 1;
            }
            seen
        });
        written.unwrap();
        assert!(lines >= 3, "tar -v lists every member");
        pack.wait().await.unwrap();

        let restore_root = dir.path().join("restored");
        let dest = restore_root.join("system");
        std::fs::create_dir_all(&dest).unwrap();

        let mut unpack = spawn_tar_unpack(&dest).unwrap();
        let stdin = unpack.take_stdin().unwrap();
        let files = shard_files(&base);
        let (fed, _) = tokio::join!(feed_shards(&files, stdin), async {
            while let Ok(Some(_)) = unpack.next_line().await {}
        });
        fed.unwrap();
        unpack.wait().await.unwrap();

        assert_eq!(std::fs::read(dest.join("app/one.apk")).unwrap(), b"first");
        assert_eq!(std::fs::read(dest.join("build.prop")).unwrap(), b"ro.build=1");
    }
}
