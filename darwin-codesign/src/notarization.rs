// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Notarization of signed binaries.

Notarization works by uploading content to Apple, then waiting for Apple to
inspect that upload and reach a verdict.

A submission is created with the SHA-256 of the payload, which yields
temporary S3 credentials. The payload is uploaded to S3 and the submission
is polled until it leaves the `In Progress` state.
*/

use {
    crate::{
        app_store_connect::{
            notary_api::{NewSubmissionResponse, NewSubmissionResponseDataAttributes, SubmissionStatus},
            AppStoreConnectClient,
        },
        clock::{Clock, SystemClock},
        error::DarwinCodesignError,
    },
    aws_smithy_http::byte_stream::ByteStream,
    darwin_macho::MachFile,
    log::{info, warn},
    std::{
        io::Write,
        path::Path,
        sync::{Arc, Condvar, Mutex},
        time::Duration,
    },
};

/// Region of the notary upload bucket.
const NOTARY_S3_REGION: &str = "us-west-2";

/// Exponential backoff stops doubling after this many consecutive failures.
const MAX_BACKOFF_SHIFT: u32 = 6;

/// Default limit on a single upload attempt.
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Delay before retrying after `failures` consecutive transient failures.
fn backoff_delay(interval: Duration, failures: u32) -> Duration {
    interval * (1u32 << failures.saturating_sub(1).min(MAX_BACKOFF_SHIFT))
}

/// A flag that aborts waiting on a submission.
///
/// Clones share the flag. Cancelling wakes any thread blocked in
/// [CancellationToken::wait_timeout].
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<(Mutex<bool>, Condvar)>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (lock, condvar) = &*self.0;
        let mut cancelled = match lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *cancelled = true;
        condvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        match self.0 .0.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Block for up to `duration`. Returns whether the token was cancelled.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let (lock, condvar) = &*self.0;
        let guard = match lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        match condvar.wait_timeout_while(guard, duration, |cancelled| !*cancelled) {
            Ok((guard, _)) => *guard,
            Err(poisoned) => *poisoned.into_inner().0,
        }
    }
}

/// Something that reports the status of a submission.
pub trait StatusSource {
    fn submission_status(&self, submission_id: &str) -> Result<SubmissionStatus, DarwinCodesignError>;
}

impl StatusSource for AppStoreConnectClient {
    fn submission_status(&self, submission_id: &str) -> Result<SubmissionStatus, DarwinCodesignError> {
        Ok(self.get_submission(submission_id)?.data.attributes.status)
    }
}

/// Waits between polls.
pub trait Sleeper {
    /// Sleep for `duration` unless cancelled first. Returns whether cancelled.
    fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool;
}

/// A [Sleeper] blocking on the cancellation token's condition variable.
#[derive(Clone, Copy, Debug, Default)]
pub struct CondvarSleeper;

impl Sleeper for CondvarSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        cancel.wait_timeout(duration)
    }
}

/// How a submission is polled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollSettings {
    /// Delay between successful polls.
    pub interval: Duration,
    /// Give up once a submission has been in progress this long.
    pub timeout: Duration,
    /// Consecutive transient failures tolerated before giving up.
    pub max_retries: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(900),
            max_retries: 5,
        }
    }
}

/// Polls a submission until it reaches a verdict.
pub struct SubmissionPoller<'a> {
    source: &'a dyn StatusSource,
    settings: PollSettings,
    clock: Box<dyn Clock>,
    sleeper: Box<dyn Sleeper>,
    cancel: CancellationToken,
}

impl<'a> SubmissionPoller<'a> {
    pub fn new(source: &'a dyn StatusSource, settings: PollSettings) -> Self {
        Self {
            source,
            settings,
            clock: Box::new(SystemClock),
            sleeper: Box::new(CondvarSleeper),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Box<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Poll until the submission reaches a terminal state.
    ///
    /// `InProgress` past the timeout yields [DarwinCodesignError::PollTimeout].
    /// Transient failures are retried with exponential backoff; others are
    /// returned immediately.
    pub fn wait(&self, submission_id: &str) -> Result<SubmissionStatus, DarwinCodesignError> {
        warn!(
            "waiting up to {}s for submission {} to finish processing",
            self.settings.timeout.as_secs(),
            submission_id
        );

        let start = self.clock.now();
        let mut failures = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Err(DarwinCodesignError::PollCancelled(submission_id.to_string()));
            }

            let result = self.source.submission_status(submission_id);
            let elapsed = self.clock.now().saturating_sub(start);

            let delay = match result {
                Ok(status) => {
                    failures = 0;
                    info!("poll state after {}s: {}", elapsed.as_secs(), status);

                    if status.is_terminal() {
                        return Ok(status);
                    }

                    if elapsed >= self.settings.timeout {
                        warn!("reached wait limit after {}s", elapsed.as_secs());
                        return Err(DarwinCodesignError::PollTimeout {
                            submission_id: submission_id.to_string(),
                            waited_seconds: elapsed.as_secs(),
                        });
                    }

                    self.settings.interval
                }
                Err(e) if e.is_transient() => {
                    failures += 1;

                    if failures > self.settings.max_retries {
                        return Err(DarwinCodesignError::PollRetriesExhausted {
                            attempts: failures,
                            source: Box::new(e),
                        });
                    }

                    let delay = backoff_delay(self.settings.interval, failures);
                    warn!(
                        "transient error polling submission (attempt {}): {}; retrying in {}s",
                        failures,
                        e,
                        delay.as_secs()
                    );

                    delay
                }
                Err(e) => return Err(e),
            };

            if self.sleeper.sleep(delay, &self.cancel) {
                return Err(DarwinCodesignError::PollCancelled(submission_id.to_string()));
            }
        }
    }
}

/// Run a notary operation, retrying transient failures.
///
/// Retries follow the backoff and retry bound of `settings`. `subject` names
/// what is being worked on for logging and cancellation.
pub fn retry_transient<T>(
    step: &str,
    subject: &str,
    settings: &PollSettings,
    sleeper: &dyn Sleeper,
    cancel: &CancellationToken,
    mut operation: impl FnMut() -> Result<T, DarwinCodesignError>,
) -> Result<T, DarwinCodesignError> {
    let mut failures = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(DarwinCodesignError::PollCancelled(subject.to_string()));
        }

        match operation() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                failures += 1;

                if failures > settings.max_retries {
                    return Err(DarwinCodesignError::PollRetriesExhausted {
                        attempts: failures,
                        source: Box::new(e),
                    });
                }

                let delay = backoff_delay(settings.interval, failures);
                warn!(
                    "transient error {} {} (attempt {}): {}; retrying in {}s",
                    step,
                    subject,
                    failures,
                    e,
                    delay.as_secs()
                );

                if sleeper.sleep(delay, cancel) {
                    return Err(DarwinCodesignError::PollCancelled(subject.to_string()));
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Wrap a binary into a single entry zip archive.
///
/// The Notary API does not accept bare Mach-O files.
pub fn binary_to_zip(name: &str, data: &[u8]) -> Result<Vec<u8>, DarwinCodesignError> {
    let mut zf = zip::ZipWriter::new(std::io::Cursor::new(vec![]));

    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o755);

    zf.start_file(name, options)?;
    zf.write_all(data)?;

    Ok(zf.finish()?.into_inner())
}

/// Drive a future to completion, failing with a transient [DarwinCodesignError::Upload]
/// when it makes no progress within `timeout`.
fn block_on_upload<T, E: std::fmt::Display>(
    runtime: &tokio::runtime::Runtime,
    timeout: Duration,
    future: impl std::future::Future<Output = Result<T, E>>,
) -> Result<T, DarwinCodesignError> {
    // The timer must be created inside the runtime.
    match runtime.block_on(async { tokio::time::timeout(timeout, future).await }) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(DarwinCodesignError::Upload(e.to_string())),
        Err(_) => Err(DarwinCodesignError::Upload(format!(
            "upload did not complete within {}s",
            timeout.as_secs()
        ))),
    }
}

/// Upload a payload to the S3 location handed out for a submission.
///
/// An upload taking longer than `timeout` is abandoned.
pub fn upload_s3_package(
    target: &NewSubmissionResponseDataAttributes,
    data: Vec<u8>,
    timeout: Duration,
) -> Result<(), DarwinCodesignError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let credentials = aws_sdk_s3::Credentials::new(
        target.aws_access_key_id.clone(),
        target.aws_secret_access_key.clone(),
        Some(target.aws_session_token.clone()),
        None,
        "darwin-codesign",
    );

    let config = runtime.block_on(
        aws_config::from_env()
            .credentials_provider(credentials)
            .region(aws_sdk_s3::Region::new(NOTARY_S3_REGION))
            .load(),
    );

    let s3 = aws_sdk_s3::Client::new(&config);

    info!(
        "uploading {} bytes to s3://{}/{}",
        data.len(),
        target.bucket,
        target.object
    );

    block_on_upload(
        &runtime,
        timeout,
        s3.put_object()
            .bucket(&target.bucket)
            .key(&target.object)
            .body(ByteStream::from(data))
            .send(),
    )?;

    info!("upload complete");

    Ok(())
}

/// A submission known to the notary service.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Submission {
    pub id: String,
    pub name: String,
}

impl Submission {
    pub fn from_response(response: &NewSubmissionResponse, name: impl ToString) -> Self {
        Self {
            id: response.data.id.clone(),
            name: name.to_string(),
        }
    }
}

/// Result of [Notarizer::notarize_path].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NotarizationOutcome {
    /// Dry run; nothing was sent.
    Skipped,
    /// Uploaded without waiting for a verdict.
    Submitted(Submission),
    /// Uploaded and accepted.
    Accepted(Submission),
}

/// Submits signed binaries to the Notary API.
pub struct Notarizer {
    client: Option<AppStoreConnectClient>,
    poll: PollSettings,
    upload_timeout: Duration,
    sleeper: Box<dyn Sleeper>,
    cancel: CancellationToken,
}

impl Notarizer {
    pub fn new(client: AppStoreConnectClient, poll: PollSettings) -> Self {
        Self {
            client: Some(client),
            poll,
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
            sleeper: Box::new(CondvarSleeper),
            cancel: CancellationToken::new(),
        }
    }

    /// An instance that logs what it would do and skips notarization.
    pub fn dry_run(poll: PollSettings) -> Self {
        Self {
            client: None,
            poll,
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
            sleeper: Box::new(CondvarSleeper),
            cancel: CancellationToken::new(),
        }
    }

    /// Limit each upload attempt to `timeout`.
    pub fn with_upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout = timeout;
        self
    }

    /// Replace how retries of submission creation and upload wait.
    pub fn with_sleeper(mut self, sleeper: Box<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Token aborting any wait performed by this instance.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn client(&self) -> Option<&AppStoreConnectClient> {
        self.client.as_ref()
    }

    /// Notarize a signed Mach-O binary.
    ///
    /// With `wait`, polls until a verdict and fails unless it is `Accepted`.
    pub fn notarize_path(
        &self,
        path: &Path,
        wait: bool,
    ) -> Result<NotarizationOutcome, DarwinCodesignError> {
        self.notarize_inner(path, wait)
            .map_err(|e| e.in_stage("notarizing", path))
    }

    fn notarize_inner(
        &self,
        path: &Path,
        wait: bool,
    ) -> Result<NotarizationOutcome, DarwinCodesignError> {
        let client = match &self.client {
            Some(client) => client,
            None => {
                warn!("[DRY RUN] skipping notarization of {}", path.display());
                return Ok(NotarizationOutcome::Skipped);
            }
        };

        let name = path
            .file_name()
            .ok_or_else(|| {
                DarwinCodesignError::CliGeneralError("unable to resolve file name".into())
            })?
            .to_string_lossy()
            .to_string();

        let data = std::fs::read(path)?;
        let unsigned = MachFile::parse(&data)?
            .images()
            .iter()
            .any(|image| image.code_signature_command().is_none());
        if unsigned {
            warn!("{} is not signed; the notary service will reject it", path.display());
        }

        let submission_name = format!("{}.zip", name);
        let payload = binary_to_zip(&name, &data)?;
        let digest = hex::encode(ring::digest::digest(&ring::digest::SHA256, &payload));
        info!("submission {} has SHA-256 {}", submission_name, digest);

        let response = retry_transient(
            "creating submission",
            &submission_name,
            &self.poll,
            self.sleeper.as_ref(),
            &self.cancel,
            || client.create_submission(&digest, &submission_name),
        )?;
        let submission = Submission::from_response(&response, &submission_name);
        warn!("created submission {}", submission.id);

        retry_transient(
            "uploading",
            &submission_name,
            &self.poll,
            self.sleeper.as_ref(),
            &self.cancel,
            || upload_s3_package(&response.data.attributes, payload.clone(), self.upload_timeout),
        )?;

        if !wait {
            return Ok(NotarizationOutcome::Submitted(submission));
        }

        let status = self.wait_for_verdict(client, &submission.id)?;
        match status {
            SubmissionStatus::Accepted => {
                warn!("submission {} accepted", submission.id);
                Ok(NotarizationOutcome::Accepted(submission))
            }
            status => Err(DarwinCodesignError::NotarizationFailed {
                submission_id: submission.id,
                status: status.to_string(),
            }),
        }
    }

    /// Wait on an existing submission.
    ///
    /// The developer log is logged unless the verdict is `Accepted`.
    pub fn wait_on_submission(
        &self,
        submission_id: &str,
    ) -> Result<SubmissionStatus, DarwinCodesignError> {
        let client = self.client.as_ref().ok_or_else(|| {
            DarwinCodesignError::Config("notary credentials are not configured".to_string())
        })?;

        self.wait_for_verdict(client, submission_id)
    }

    fn wait_for_verdict(
        &self,
        client: &AppStoreConnectClient,
        submission_id: &str,
    ) -> Result<SubmissionStatus, DarwinCodesignError> {
        let status = SubmissionPoller::new(client, self.poll)
            .with_cancellation(self.cancel.clone())
            .wait(submission_id)?;

        if status != SubmissionStatus::Accepted {
            match client.get_submission_log(submission_id) {
                Ok(log) => {
                    let text = serde_json::to_string_pretty(&log)?;
                    for line in text.lines() {
                        warn!("notary log> {}", line);
                    }
                }
                Err(e) => warn!("unable to fetch notary log: {}", e),
            }
        }

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::clock::tests::ManualClock,
        std::sync::atomic::{AtomicUsize, Ordering},
    };

    struct ScriptedSource<F> {
        calls: AtomicUsize,
        script: F,
    }

    impl<F> ScriptedSource<F>
    where
        F: Fn(usize) -> Result<SubmissionStatus, DarwinCodesignError>,
    {
        fn new(script: F) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                script,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl<F> StatusSource for ScriptedSource<F>
    where
        F: Fn(usize) -> Result<SubmissionStatus, DarwinCodesignError>,
    {
        fn submission_status(&self, _: &str) -> Result<SubmissionStatus, DarwinCodesignError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.script)(call)
        }
    }

    /// Advances a [ManualClock] instead of blocking.
    struct RecordingSleeper {
        clock: ManualClock,
        sleeps: Arc<Mutex<Vec<Duration>>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> bool {
            self.sleeps.lock().unwrap().push(duration);
            self.clock.advance(duration);
            cancel.is_cancelled()
        }
    }

    fn settings(interval: u64, timeout: u64, max_retries: u32) -> PollSettings {
        PollSettings {
            interval: Duration::from_secs(interval),
            timeout: Duration::from_secs(timeout),
            max_retries,
        }
    }

    fn poller<'a>(
        source: &'a dyn StatusSource,
        settings: PollSettings,
    ) -> (SubmissionPoller<'a>, Arc<Mutex<Vec<Duration>>>) {
        let clock = ManualClock::new(1_000);
        let sleeps = Arc::new(Mutex::new(vec![]));
        let sleeper = RecordingSleeper {
            clock: clock.clone(),
            sleeps: sleeps.clone(),
        };

        let poller = SubmissionPoller::new(source, settings)
            .with_clock(Box::new(clock))
            .with_sleeper(Box::new(sleeper));

        (poller, sleeps)
    }

    fn http(status: u16) -> DarwinCodesignError {
        DarwinCodesignError::NotaryHttp {
            status,
            message: String::new(),
        }
    }

    #[test]
    fn accepted_after_three_polls() {
        let source = ScriptedSource::new(|call| {
            Ok(match call {
                0 | 1 => SubmissionStatus::InProgress,
                _ => SubmissionStatus::Accepted,
            })
        });
        let (poller, sleeps) = poller(&source, settings(10, 900, 5));

        assert_eq!(poller.wait("id").unwrap(), SubmissionStatus::Accepted);
        assert_eq!(source.calls(), 3);
        assert_eq!(sleeps.lock().unwrap().len(), 2);
    }

    #[test]
    fn terminal_rejections_returned() {
        let source = ScriptedSource::new(|_| Ok(SubmissionStatus::Invalid));
        let (poller, _) = poller(&source, settings(10, 900, 5));

        assert_eq!(poller.wait("id").unwrap(), SubmissionStatus::Invalid);
        assert_eq!(source.calls(), 1);
    }

    #[test]
    fn timeout_at_interval_n() {
        let source = ScriptedSource::new(|_| Ok(SubmissionStatus::InProgress));
        let (poller, sleeps) = poller(&source, settings(10, 40, 5));

        match poller.wait("abc") {
            Err(DarwinCodesignError::PollTimeout {
                submission_id,
                waited_seconds,
            }) => {
                assert_eq!(submission_id, "abc");
                assert_eq!(waited_seconds, 40);
            }
            other => panic!("unexpected result: {:?}", other),
        }

        // Polls at 0, 10, 20, 30 and 40 seconds.
        assert_eq!(source.calls(), 5);
        assert_eq!(sleeps.lock().unwrap().len(), 4);
    }

    #[test]
    fn transient_failures_back_off() {
        let source = ScriptedSource::new(|call| match call {
            0 => Err(http(503)),
            1 => Err(http(429)),
            _ => Ok(SubmissionStatus::Accepted),
        });
        let (poller, sleeps) = poller(&source, settings(10, 900, 5));

        assert_eq!(poller.wait("id").unwrap(), SubmissionStatus::Accepted);
        assert_eq!(
            *sleeps.lock().unwrap(),
            vec![Duration::from_secs(10), Duration::from_secs(20)]
        );
    }

    #[test]
    fn retries_exhausted() {
        let source = ScriptedSource::new(|_| Err(http(502)));
        let (poller, _) = poller(&source, settings(1, 900, 2));

        match poller.wait("id") {
            Err(DarwinCodesignError::PollRetriesExhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, DarwinCodesignError::NotaryHttp { status: 502, .. }));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(source.calls(), 3);
    }

    #[test]
    fn non_transient_failure_is_fatal() {
        let source = ScriptedSource::new(|_| Err(http(401)));
        let (poller, sleeps) = poller(&source, settings(10, 900, 5));

        assert!(matches!(
            poller.wait("id"),
            Err(DarwinCodesignError::NotaryHttp { status: 401, .. })
        ));
        assert_eq!(source.calls(), 1);
        assert!(sleeps.lock().unwrap().is_empty());
    }

    #[test]
    fn cancelled_between_polls() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let source = ScriptedSource::new(move |call| {
            if call == 1 {
                trigger.cancel();
            }
            Ok(SubmissionStatus::InProgress)
        });
        let (poller, _) = poller(&source, settings(10, 900, 5));
        let poller = poller.with_cancellation(cancel);

        assert!(matches!(
            poller.wait("id"),
            Err(DarwinCodesignError::PollCancelled(_))
        ));
        assert_eq!(source.calls(), 2);
    }

    #[test]
    fn cancellation_wakes_waiter() {
        let cancel = CancellationToken::new();
        let waiter = cancel.clone();

        let handle = std::thread::spawn(move || {
            let start = std::time::Instant::now();
            let cancelled = CondvarSleeper.sleep(Duration::from_secs(60), &waiter);
            (cancelled, start.elapsed())
        });

        std::thread::sleep(Duration::from_millis(50));
        cancel.cancel();

        let (cancelled, elapsed) = handle.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(30));

        assert!(!CancellationToken::new().wait_timeout(Duration::from_millis(1)));
    }

    fn recording_sleeper() -> (RecordingSleeper, Arc<Mutex<Vec<Duration>>>) {
        let sleeps = Arc::new(Mutex::new(vec![]));
        let sleeper = RecordingSleeper {
            clock: ManualClock::new(1_000),
            sleeps: sleeps.clone(),
        };

        (sleeper, sleeps)
    }

    #[test]
    fn create_retried_after_unavailable() {
        let (sleeper, sleeps) = recording_sleeper();
        let mut calls = 0;

        let result = retry_transient(
            "creating submission",
            "tool.zip",
            &settings(10, 900, 5),
            &sleeper,
            &CancellationToken::new(),
            || {
                calls += 1;
                if calls == 1 {
                    Err(http(503))
                } else {
                    Ok("submission-id")
                }
            },
        );

        assert_eq!(result.unwrap(), "submission-id");
        assert_eq!(calls, 2);
        assert_eq!(*sleeps.lock().unwrap(), vec![Duration::from_secs(10)]);
    }

    #[test]
    fn upload_retries_exhausted() {
        let (sleeper, sleeps) = recording_sleeper();
        let mut calls = 0;

        let result: Result<(), _> = retry_transient(
            "uploading",
            "tool.zip",
            &settings(1, 900, 2),
            &sleeper,
            &CancellationToken::new(),
            || {
                calls += 1;
                Err(DarwinCodesignError::Upload("connection reset".into()))
            },
        );

        match result {
            Err(DarwinCodesignError::PollRetriesExhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, DarwinCodesignError::Upload(_)));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(calls, 3);
        assert_eq!(
            *sleeps.lock().unwrap(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[test]
    fn rejected_create_not_retried() {
        let (sleeper, sleeps) = recording_sleeper();
        let mut calls = 0;

        let result: Result<(), _> = retry_transient(
            "creating submission",
            "tool.zip",
            &settings(10, 900, 5),
            &sleeper,
            &CancellationToken::new(),
            || {
                calls += 1;
                Err(http(401))
            },
        );

        assert!(matches!(
            result,
            Err(DarwinCodesignError::NotaryHttp { status: 401, .. })
        ));
        assert_eq!(calls, 1);
        assert!(sleeps.lock().unwrap().is_empty());
    }

    #[test]
    fn cancelled_before_retry() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (sleeper, _) = recording_sleeper();

        let result: Result<(), _> = retry_transient(
            "uploading",
            "tool.zip",
            &settings(10, 900, 5),
            &sleeper,
            &cancel,
            || Ok(()),
        );

        assert!(matches!(result, Err(DarwinCodesignError::PollCancelled(_))));
    }

    #[test]
    fn stalled_upload_times_out() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let stalled = block_on_upload(&runtime, Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, std::io::Error>(())
        });
        let err = stalled.unwrap_err();
        assert!(matches!(err, DarwinCodesignError::Upload(_)));
        assert!(err.is_transient());

        let completed =
            block_on_upload(&runtime, Duration::from_secs(5), async { Ok::<_, std::io::Error>(42) });
        assert_eq!(completed.unwrap(), 42);
    }

    #[test]
    fn zip_payload() {
        let data = b"\xcf\xfa\xed\xfe binary content".repeat(100);
        let zip_data = binary_to_zip("tool", &data).unwrap();

        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(zip_data)).unwrap();
        assert_eq!(archive.len(), 1);

        let mut entry = archive.by_index(0).unwrap();
        assert_eq!(entry.name(), "tool");
        assert_eq!(entry.compression(), zip::CompressionMethod::Deflated);

        let mut extracted = vec![];
        std::io::Read::read_to_end(&mut entry, &mut extracted).unwrap();
        assert_eq!(extracted, data);
    }

    #[test]
    fn dry_run_skips() {
        let notarizer = Notarizer::dry_run(PollSettings::default());
        assert!(notarizer.client().is_none());
        assert_eq!(
            notarizer
                .notarize_path(Path::new("/nonexistent/tool"), true)
                .unwrap(),
            NotarizationOutcome::Skipped
        );
    }
}
