// Raw pass-through consumer engine.
//
// Drives one recording from "bytes arriving on the ring buffer" to "bytes
// landing at the chosen destination". The engine locks on to the first video
// PES boundary, then streams in large transfers, and can cut over to a new
// destination mid-recording without losing or duplicating a byte.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::fs::File;
use tokio::sync::oneshot;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use super::ConsumerError;
use crate::buffer::{BufferError, StreamRing};
use crate::options::{OptionError, OptionStore};
use crate::sink::{ActiveSink, FileSink, UploadSink};
use crate::ts;
use crate::upload::MediaUploadClient;

/// How many windows to search for a random-access indicator before falling
/// back to any video PES start.
const SWITCH_RAI_ATTEMPTS: i32 = 100;

#[derive(Debug, Clone)]
pub struct RawConsumerOptions {
    pub upload_id_enabled: bool,
    /// Smallest transfer handed to a sink, except at switch or shutdown.
    pub min_transfer_size: usize,
    /// Scratch window size; the largest single transfer.
    pub max_transfer_size: usize,
    /// Ring buffer capacity; raised to 2x max_transfer_size when below.
    pub stream_buffer_size: usize,
    pub upload_id_port: u16,
    /// Byte count that triggers the file sink's direct-flush check.
    pub direct_flush_min: u64,
}

impl Default for RawConsumerOptions {
    fn default() -> Self {
        Self {
            upload_id_enabled: true,
            min_transfer_size: 65_536,
            max_transfer_size: 1_048_476,
            stream_buffer_size: 2_097_152,
            upload_id_port: 7818,
            direct_flush_min: 1_048_576,
        }
    }
}

impl RawConsumerOptions {
    /// Loads the `consumer.raw.*` options. Invalid persisted values are
    /// logged, reset to defaults in the store, and never propagate out.
    pub fn from_store(store: &OptionStore) -> Self {
        match Self::try_from_store(store) {
            Ok(opts) => opts,
            Err(e) => {
                warn!("invalid raw consumer options, reverting to defaults: {e}");
                Self::default().write_to(store);
                Self::try_from_store(store).unwrap_or_default()
            }
        }
    }

    fn try_from_store(store: &OptionStore) -> Result<Self, OptionError> {
        let min_transfer_size =
            store.get_integer("consumer.raw.min_transfer_size", 65_536, 16_384, 262_144)? as usize;
        let max_transfer_size = store.get_integer(
            "consumer.raw.max_transfer_size",
            1_048_476,
            786_432,
            1_048_576,
        )? as usize;
        let mut stream_buffer_size = store.get_integer(
            "consumer.raw.stream_buffer_size",
            2_097_152,
            2_097_152,
            33_554_432,
        )? as usize;
        if stream_buffer_size < 2 * max_transfer_size {
            stream_buffer_size = 2 * max_transfer_size;
        }
        Ok(Self {
            upload_id_enabled: store.get_bool("consumer.raw.upload_id_enabled", true),
            min_transfer_size,
            max_transfer_size,
            stream_buffer_size,
            upload_id_port: store.get_integer("consumer.raw.upload_id_port", 7818, 1024, 65_535)?
                as u16,
            direct_flush_min: store.get_integer(
                "consumer.raw.direct_flush_min",
                1_048_576,
                0,
                i64::MAX,
            )? as u64,
        })
    }

    fn write_to(&self, store: &OptionStore) {
        store.set_bool("consumer.raw.upload_id_enabled", self.upload_id_enabled);
        store.set_raw(
            "consumer.raw.min_transfer_size",
            &self.min_transfer_size.to_string(),
        );
        store.set_raw(
            "consumer.raw.max_transfer_size",
            &self.max_transfer_size.to_string(),
        );
        store.set_raw(
            "consumer.raw.stream_buffer_size",
            &self.stream_buffer_size.to_string(),
        );
        store.set_raw(
            "consumer.raw.upload_id_port",
            &self.upload_id_port.to_string(),
        );
        store.set_raw(
            "consumer.raw.direct_flush_min",
            &self.direct_flush_min.to_string(),
        );
    }
}

/// Destination configured before the engine starts.
enum Target {
    File { path: PathBuf },
    Upload {
        filename: String,
        upload_id: i32,
        addr: SocketAddr,
    },
    Null,
}

struct TargetState {
    target: Option<Target>,
    /// File opened eagerly by `consume_to_filename` so create failures
    /// surface to the caller before streaming begins.
    pending_file: Option<File>,
}

/// Destination requested mid-recording.
enum SwitchTarget {
    File { path: PathBuf, file: File },
    Upload { filename: String, upload_id: i32 },
}

struct SwitchRequest {
    target: SwitchTarget,
    cap: u64,
    ack: oneshot::Sender<bool>,
}

/// One streaming consumer per active recording.
///
/// The producer task calls [`write`](Self::write); the engine task runs
/// [`run`](Self::run); the controller switches and stops from anywhere.
pub struct RawConsumer {
    opts: RawConsumerOptions,
    ring: StreamRing,
    running: AtomicBool,
    bytes_streamed: AtomicU64,
    record_buffer_cap: AtomicU64,
    target: Mutex<TargetState>,
    upload_addr: Mutex<Option<SocketAddr>>,
    switch: Mutex<Option<SwitchRequest>>,
    switch_pending: AtomicBool,
    channel: Mutex<String>,
    quality: Mutex<Option<String>>,
    current_filename: Mutex<Option<String>>,
    current_upload_id: AtomicI32,
    desired_program: AtomicI32,
}

impl std::fmt::Debug for RawConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawConsumer")
            .field("channel", &Self::lock(&self.channel))
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl RawConsumer {
    pub fn new(opts: RawConsumerOptions) -> Self {
        let ring = StreamRing::new(opts.stream_buffer_size);
        Self {
            opts,
            ring,
            running: AtomicBool::new(false),
            bytes_streamed: AtomicU64::new(0),
            record_buffer_cap: AtomicU64::new(0),
            target: Mutex::new(TargetState {
                target: None,
                pending_file: None,
            }),
            upload_addr: Mutex::new(None),
            switch: Mutex::new(None),
            switch_pending: AtomicBool::new(false),
            channel: Mutex::new(String::new()),
            quality: Mutex::new(None),
            current_filename: Mutex::new(None),
            current_upload_id: AtomicI32::new(-1),
            desired_program: AtomicI32::new(-1),
        }
    }

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records to a local file. The file is created now so a failure is
    /// reported before any byte is consumed.
    pub async fn consume_to_filename(&self, path: impl AsRef<Path>) -> Result<(), ConsumerError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).await.map_err(|e| {
            error!(path = %path.display(), "unable to create the recording file: {e}");
            ConsumerError::CreateFile {
                path: path.display().to_string(),
                source: e,
            }
        })?;
        *Self::lock(&self.current_filename) = Some(path.display().to_string());
        let mut state = Self::lock(&self.target);
        state.target = Some(Target::File { path });
        state.pending_file = Some(file);
        Ok(())
    }

    /// Records through the recorder's media-upload service.
    pub fn consume_to_upload_id(&self, filename: &str, upload_id: i32, recorder: IpAddr) {
        let addr = SocketAddr::new(recorder, self.opts.upload_id_port);
        *Self::lock(&self.upload_addr) = Some(addr);
        *Self::lock(&self.current_filename) = Some(filename.to_string());
        self.current_upload_id.store(upload_id, Ordering::Release);
        Self::lock(&self.target).target = Some(Target::Upload {
            filename: filename.to_string(),
            upload_id,
            addr,
        });
    }

    /// Counts bytes without writing them anywhere.
    pub fn consume_to_null(&self) {
        Self::lock(&self.target).target = Some(Target::Null);
    }

    /// Recorder-side circular buffer size for the initial destination.
    pub fn set_record_buffer_size(&self, cap: u64) {
        self.record_buffer_cap.store(cap, Ordering::Release);
    }

    pub fn set_channel(&self, channel: &str) {
        *Self::lock(&self.channel) = channel.to_string();
    }

    pub fn channel(&self) -> String {
        Self::lock(&self.channel).clone()
    }

    pub fn set_quality(&self, quality: &str) {
        *Self::lock(&self.quality) = Some(quality.to_string());
    }

    pub fn quality(&self) -> Option<String> {
        Self::lock(&self.quality).clone()
    }

    pub fn set_program(&self, program: i32) {
        self.desired_program.store(program, Ordering::Release);
    }

    pub fn program(&self) -> i32 {
        self.desired_program.load(Ordering::Acquire)
    }

    pub fn recording_filename(&self) -> Option<String> {
        Self::lock(&self.current_filename).clone()
    }

    pub fn upload_id(&self) -> i32 {
        self.current_upload_id.load(Ordering::Acquire)
    }

    pub fn accepts_upload_id(&self) -> bool {
        self.opts.upload_id_enabled
    }

    pub fn can_switch(&self) -> bool {
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn bytes_streamed(&self) -> u64 {
        self.bytes_streamed.load(Ordering::Acquire)
    }

    /// Producer entry point: pushes tuner bytes into the ring.
    pub async fn write(&self, data: &[u8]) -> Result<(), BufferError> {
        self.ring.write(data).await
    }

    /// Stops the engine. Immediate: closes the ring and returns; the engine
    /// flushes the in-flight window and terminates at its next iteration.
    pub fn stop(&self) {
        self.ring.close();
    }

    /// Discards buffered bytes and reopens the ring for another run. Only
    /// valid while the engine is stopped.
    pub fn clear_buffer(&self) {
        self.ring.close();
        self.ring.clear();
    }

    /// Waits up to `timeout` for bytes to reach the destination.
    pub async fn is_streaming(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.bytes_streamed() > 0 {
                return true;
            }
            if !self.is_running() || Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(100)).await;
        }
    }

    /// Requests a cutover to a new file and waits for the engine to complete
    /// it. The new file is created now; a create failure leaves the current
    /// destination untouched.
    pub async fn switch_to_filename(
        &self,
        path: impl AsRef<Path>,
        cap: u64,
    ) -> Result<(), ConsumerError> {
        let path = path.as_ref().to_path_buf();
        info!(path = %path.display(), "switch to a new file was requested");
        let file = File::create(&path).await.map_err(|e| {
            error!(path = %path.display(), "unable to create the recording file: {e}");
            ConsumerError::CreateFile {
                path: path.display().to_string(),
                source: e,
            }
        })?;
        self.submit_switch(SwitchTarget::File { path, file }, cap)
            .await
    }

    /// Requests a cutover to a new upload session and waits for it.
    pub async fn switch_to_upload_id(
        &self,
        filename: &str,
        upload_id: i32,
        cap: u64,
    ) -> Result<(), ConsumerError> {
        info!(filename, upload_id, "switch to a new upload id was requested");
        self.submit_switch(
            SwitchTarget::Upload {
                filename: filename.to_string(),
                upload_id,
            },
            cap,
        )
        .await
    }

    async fn submit_switch(&self, target: SwitchTarget, cap: u64) -> Result<(), ConsumerError> {
        if !self.is_running() {
            return Err(ConsumerError::NotRunning);
        }
        let (ack, done) = oneshot::channel();
        {
            let mut slot = Self::lock(&self.switch);
            if slot.is_some() {
                return Err(ConsumerError::SwitchPending);
            }
            *slot = Some(SwitchRequest { target, cap, ack });
        }
        self.switch_pending.store(true, Ordering::Release);

        // The engine fails pending requests on its way out; if it exited
        // between the liveness check and the insert, clean up ourselves.
        if !self.is_running() {
            Self::lock(&self.switch).take();
            self.switch_pending.store(false, Ordering::Release);
            return Err(ConsumerError::NotRunning);
        }

        match done.await {
            Ok(true) => Ok(()),
            _ => Err(ConsumerError::SwitchFailed),
        }
    }

    /// Runs the engine until the producer closes the ring, `stop` is called,
    /// or a fatal stream error occurs. Starting a running engine is a
    /// programmer error.
    pub async fn run(&self) -> Result<(), ConsumerError> {
        eprintln!("DEBUG run enter");
        if self.running.swap(true, Ordering::SeqCst) {
            eprintln!("DEBUG already running");
            return Err(ConsumerError::AlreadyRunning);
        }
        info!(channel = %self.channel(), "raw consumer is now running");

        let result = self.stream_loop().await;
        eprintln!("DEBUG stream_loop result={result:?}");

        if let Some(request) = Self::lock(&self.switch).take() {
            let _ = request.ack.send(false);
        }
        self.switch_pending.store(false, Ordering::Release);

        debug!(
            read_available = self.ring.read_available(),
            write_available = self.ring.write_available(),
            bytes_streamed = self.bytes_streamed(),
            "raw consumer stopping"
        );
        if let Err(e) = &result {
            error!(
                channel = %self.channel(),
                filename = ?self.recording_filename(),
                upload_id = self.upload_id(),
                "raw consumer stopped on an error: {e}"
            );
        }
        self.running.store(false, Ordering::SeqCst);
        info!("raw consumer has stopped");
        result
    }

    async fn stream_loop(&self) -> Result<(), ConsumerError> {
        let mut sink = self.open_initial_sink().await?;

        let mut window = vec![0u8; self.opts.max_transfer_size];
        let mut locked_on = false;
        let mut video_pid: Option<u16> = None;
        let mut rai_attempts = SWITCH_RAI_ATTEMPTS;
        let mut drained = false;

        info!("waiting for a video PES start");
        eprintln!("DEBUG entering outer loop");

        while !drained {
            eprintln!("DEBUG outer loop iter");
            let mut filled = 0usize;
            while filled < self.opts.min_transfer_size {
                match self.ring.read(&mut window[filled..]).await {
                    Ok(n) => filled += n,
                    Err(BufferError::Closed) => {
                        drained = true;
                        break;
                    }
                }
                if self.switch_pending.load(Ordering::Acquire) {
                    break;
                }
            }
            eprintln!("DEBUG filled={filled} drained={drained} locked_on={locked_on}");
            if filled == 0 {
                if drained {
                    break;
                }
                continue;
            }

            let mut pos = 0usize;
            if !locked_on {
                match ts::find_video_pes_start(&window[..filled], None) {
                    Some(start) => {
                        video_pid = ts::packet_pid(&window[start..filled]);
                        pos = start;
                        locked_on = true;
                        info!(offset = start, pid = video_pid, "raw consumer is now streaming");
                    }
                    // no boundary yet: consume the window without forwarding
                    None => continue,
                }
            }

            if self.switch_pending.load(Ordering::Acquire) {
                // The boundary depends on the new destination: a new file
                // must be self-contained from its first PAT, while an upload
                // continues the same program and only needs a safe decode
                // point.
                let next_is_file = matches!(
                    Self::lock(&self.switch).as_ref().map(|r| &r.target),
                    Some(SwitchTarget::File { .. })
                );
                let cut = if next_is_file {
                    ts::find_pat_start(&window[pos..filled])
                } else if rai_attempts > 0 {
                    rai_attempts -= 1;
                    ts::find_random_access(&window[pos..filled], video_pid)
                } else {
                    if rai_attempts == 0 {
                        warn!(
                            "stream does not appear to contain random access \
                             indicators, cutting on the nearest PES start"
                        );
                        rai_attempts = -1;
                    }
                    ts::find_video_pes_start(&window[pos..filled], video_pid)
                };

                if let Some(rel) = cut {
                    let cut_at = pos + rel;
                    let request = Self::lock(&self.switch).take();
                    if let Some(request) = request {
                        self.switch_pending.store(false, Ordering::Release);
                        self.write_to_sink(&mut sink, &window[pos..cut_at]).await?;
                        sink = self.cut_over(sink, request).await?;
                        rai_attempts = SWITCH_RAI_ATTEMPTS;
                        pos = cut_at;
                    }
                }
                // No boundary in this window: everything goes to the old
                // sink and the caller stays parked.
            }

            self.write_to_sink(&mut sink, &window[pos..filled]).await?;
        }

        self.close_sink(sink).await;
        Ok(())
    }

    async fn open_initial_sink(&self) -> Result<ActiveSink, ConsumerError> {
        eprintln!("DEBUG open_initial_sink enter");
        let (target, pending_file) = {
            let mut state = Self::lock(&self.target);
            (state.target.take(), state.pending_file.take())
        };
        let cap = self.record_buffer_cap.load(Ordering::Acquire);

        match target {
            None => {
                error!("raw consumer does not have a file or upload id to use");
                Err(ConsumerError::NoTarget)
            }
            Some(Target::Null) => {
                debug!("consuming to a null output");
                Ok(ActiveSink::Null)
            }
            Some(Target::File { path }) => {
                let file = match pending_file {
                    Some(file) => file,
                    None => File::create(&path).await.map_err(|e| ConsumerError::CreateFile {
                        path: path.display().to_string(),
                        source: e,
                    })?,
                };
                Ok(ActiveSink::File(FileSink::from_file(
                    file,
                    path,
                    cap,
                    self.opts.direct_flush_min,
                )))
            }
            Some(Target::Upload {
                filename,
                upload_id,
                addr,
            }) => {
                let mut client = MediaUploadClient::new(addr);
                match client.start_session(&filename, upload_id, 0).await {
                    Ok(()) => Ok(ActiveSink::Upload(UploadSink { client, cap })),
                    Err(e) => {
                        error!(
                            filename = %filename,
                            upload_id,
                            server = %addr,
                            "media server did not accept the upload session: {e}"
                        );
                        info!("attempting to write the file directly");
                        match File::create(&filename).await {
                            Ok(file) => Ok(ActiveSink::File(FileSink::from_file(
                                file,
                                PathBuf::from(&filename),
                                cap,
                                self.opts.direct_flush_min,
                            ))),
                            Err(file_err) => {
                                error!(
                                    filename = %filename,
                                    "unable to create the recording file: {file_err}"
                                );
                                Err(ConsumerError::Stream(e.to_string()))
                            }
                        }
                    }
                }
            }
        }
    }

    async fn write_to_sink(
        &self,
        sink: &mut ActiveSink,
        data: &[u8],
    ) -> Result<(), ConsumerError> {
        if data.is_empty() {
            return Ok(());
        }
        match sink {
            ActiveSink::Upload(upload) => {
                // the client already reconnected and retried once
                if let Err(e) = upload.write(data).await {
                    error!(channel = %self.channel(), "upload write failed after retry: {e}");
                    return Err(ConsumerError::Stream(e.to_string()));
                }
            }
            ActiveSink::File(file) => {
                // the OS surfaces persistent file problems; no retry here
                if let Err(e) = file.write(data).await {
                    error!(path = %file.path().display(), "file sink write failed: {e}");
                }
            }
            ActiveSink::Null => {}
        }
        self.bytes_streamed
            .fetch_add(data.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    async fn cut_over(
        &self,
        old: ActiveSink,
        request: SwitchRequest,
    ) -> Result<ActiveSink, ConsumerError> {
        let SwitchRequest { target, cap, ack } = request;

        let reusable_client = match old {
            ActiveSink::Upload(mut upload) => {
                if let Err(e) = upload.client.end_session().await {
                    debug!("error ending the previous upload session: {e}");
                }
                Some(upload.client)
            }
            ActiveSink::File(file) => {
                if let Err(e) = file.close().await {
                    error!("error closing the previous recording file: {e}");
                }
                None
            }
            ActiveSink::Null => None,
        };

        let new_sink = match target {
            SwitchTarget::File { path, file } => {
                *Self::lock(&self.current_filename) = Some(path.display().to_string());
                self.current_upload_id.store(-1, Ordering::Release);
                ActiveSink::File(FileSink::from_file(
                    file,
                    path,
                    cap,
                    self.opts.direct_flush_min,
                ))
            }
            SwitchTarget::Upload {
                filename,
                upload_id,
            } => {
                let mut client = match reusable_client {
                    Some(client) => client,
                    None => match *Self::lock(&self.upload_addr) {
                        Some(addr) => MediaUploadClient::new(addr),
                        None => {
                            let _ = ack.send(false);
                            return Err(ConsumerError::Stream(
                                "no recorder address known for an upload switch".to_string(),
                            ));
                        }
                    },
                };
                match client.start_session(&filename, upload_id, 0).await {
                    Ok(()) => {
                        *Self::lock(&self.current_filename) = Some(filename);
                        self.current_upload_id.store(upload_id, Ordering::Release);
                        ActiveSink::Upload(UploadSink { client, cap })
                    }
                    Err(e) => {
                        error!(
                            filename = %filename,
                            upload_id,
                            "media server did not accept the switch destination: {e}"
                        );
                        let _ = ack.send(false);
                        return Err(ConsumerError::Stream(e.to_string()));
                    }
                }
            }
        };

        self.bytes_streamed.store(0, Ordering::Release);
        self.record_buffer_cap.store(cap, Ordering::Release);
        let _ = ack.send(true);
        info!("switch was successful");
        Ok(new_sink)
    }

    async fn close_sink(&self, sink: ActiveSink) {
        match sink {
            ActiveSink::Upload(mut upload) => {
                if let Err(e) = upload.client.end_session().await {
                    debug!("error ending the upload session: {e}");
                }
            }
            ActiveSink::File(file) => {
                if let Err(e) = file.close().await {
                    debug!("error closing the recording file: {e}");
                }
            }
            ActiveSink::Null => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::testing::pes_start_packet;
    use std::sync::Arc;

    fn small_options() -> RawConsumerOptions {
        RawConsumerOptions {
            min_transfer_size: 256,
            max_transfer_size: 4096,
            stream_buffer_size: 8192,
            ..RawConsumerOptions::default()
        }
    }

    #[tokio::test]
    async fn run_without_a_target_fails() {
        let consumer = RawConsumer::new(small_options());
        assert!(matches!(
            consumer.run().await,
            Err(ConsumerError::NoTarget)
        ));
        assert!(!consumer.is_running());
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let consumer = Arc::new(RawConsumer::new(small_options()));
        consumer.consume_to_null();

        let engine = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.run().await })
        };
        // Feed a PES start so the engine is up and streaming.
        consumer.write(&pes_start_packet(0x100)).await.unwrap();
        assert!(consumer.is_streaming(Duration::from_secs(5)).await);

        assert!(matches!(
            consumer.run().await,
            Err(ConsumerError::AlreadyRunning)
        ));

        consumer.stop();
        engine.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn null_target_counts_bytes_from_lock_on() {
        let consumer = Arc::new(RawConsumer::new(small_options()));
        consumer.consume_to_null();

        let engine = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.run().await })
        };

        // Garbage before the PES start is consumed but never counted.
        consumer.write(&[0u8; 500]).await.unwrap();
        for _ in 0..8 {
            consumer.write(&pes_start_packet(0x100)).await.unwrap();
        }
        assert!(consumer.is_streaming(Duration::from_secs(5)).await);

        consumer.stop();
        engine.await.unwrap().unwrap();
        assert_eq!(consumer.bytes_streamed() % 188, 0);
        assert!(consumer.bytes_streamed() >= 188);
    }

    #[tokio::test]
    async fn switch_on_a_stopped_consumer_fails() {
        let consumer = RawConsumer::new(small_options());
        let err = consumer
            .switch_to_upload_id("x.mpg", 9, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumerError::NotRunning));
    }

    #[test]
    fn options_revert_to_defaults_on_bad_values() {
        let store = OptionStore::in_memory();
        store.set_raw("consumer.raw.min_transfer_size", "1"); // below range
        let opts = RawConsumerOptions::from_store(&store);
        assert_eq!(opts.min_transfer_size, 65_536);
        // the store itself was repaired
        assert_eq!(
            store.get_raw("consumer.raw.min_transfer_size").as_deref(),
            Some("65536")
        );
    }

    #[test]
    fn stream_buffer_is_raised_to_twice_the_max_transfer() {
        let store = OptionStore::in_memory();
        store.set_raw("consumer.raw.max_transfer_size", "1048576");
        store.set_raw("consumer.raw.stream_buffer_size", "2097152");
        let opts = RawConsumerOptions::from_store(&store);
        assert_eq!(opts.stream_buffer_size, 2 * 1_048_576);
    }
}
