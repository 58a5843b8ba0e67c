//! Delivery of review events to the messaging sink.
//!
//! Every review gets exactly one top-level message, created lazily before the
//! first reply and remembered in the working [`ReviewCache`]. Delivery is
//! best-effort: failures are logged and never retried.

use std::collections::HashSet;

use tracing::{debug, error, info, warn};

use crate::{
    diff::{EventKind, ReviewEvent},
    domain::{GroupDirectory, Review, ReviewId, TestStatus, ThreadHandle},
    render::{self, Message, Renderer},
    slack::{MentionResolver, Notifier},
    storage::ReviewCache,
    swarm::ReviewSource,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub threads_created: usize,
    pub replies_sent: usize,
    pub suppressed: usize,
    pub failed: usize,
}

pub struct Dispatcher<'a, N, S, M> {
    pub notifier: &'a N,
    pub source: &'a S,
    pub mentions: &'a M,
    pub renderer: &'a Renderer,
    pub groups: &'a GroupDirectory,
    pub channel: &'a str,
}

enum Outcome {
    Sent,
    Suppressed,
    Failed,
}

impl<N: Notifier, S: ReviewSource, M: MentionResolver> Dispatcher<'_, N, S, M> {
    /// Delivers `events` in order. Threads created along the way are stored
    /// on `cache`, which must already hold every review named by an event.
    pub fn dispatch(&self, events: &[ReviewEvent], cache: &mut ReviewCache) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut failed_roots: HashSet<ReviewId> = HashSet::new();

        for event in events {
            let Some(entry) = cache.get(event.review_id) else {
                warn!(review_id = event.review_id, event = event.kind.name(), "Event for review missing from cache");
                report.failed += 1;
                continue;
            };
            let review = entry.review.clone();
            info!(review_id = review.id, event = event.kind.name(), "Review event detected");

            if let EventKind::TestStatusChanged {
                to: TestStatus::Running,
                ..
            } = event.kind
            {
                report.suppressed += 1;
                continue;
            }

            let thread = match cache.thread(review.id).cloned() {
                Some(thread) => thread,
                None if failed_roots.contains(&review.id) => {
                    report.failed += 1;
                    continue;
                }
                None => match self.open_thread(&review) {
                    Some(thread) => {
                        cache.attach_thread(review.id, thread.clone());
                        report.threads_created += 1;
                        thread
                    }
                    None => {
                        failed_roots.insert(review.id);
                        report.failed += 1;
                        continue;
                    }
                },
            };

            match self.reply(&review, &event.kind, &thread) {
                Outcome::Sent => report.replies_sent += 1,
                Outcome::Suppressed => report.suppressed += 1,
                Outcome::Failed => report.failed += 1,
            }
        }

        report
    }

    fn open_thread(&self, review: &Review) -> Option<ThreadHandle> {
        let author = self.mentions.resolve_mention(&review.author);
        let reviewers: Vec<String> = render::reviewers(review, self.groups)
            .iter()
            .map(|user| self.mentions.resolve_mention(user))
            .collect();
        let message = self.renderer.thread_root(review, &author, &reviewers);

        match self.notifier.post_top(self.channel, &message) {
            Ok(thread) => {
                info!(review_id = review.id, thread = %thread, "Review thread created");
                Some(thread)
            }
            Err(err) => {
                error!(review_id = review.id, error = %err, "Failed to create review thread");
                None
            }
        }
    }

    fn reply(&self, review: &Review, kind: &EventKind, thread: &ThreadHandle) -> Outcome {
        let message = match self.render_reply(review, kind) {
            Some(message) => message,
            None => return Outcome::Suppressed,
        };

        match self.notifier.post_reply(thread, &message) {
            Ok(()) => {
                info!(review_id = review.id, event = kind.name(), thread = %thread, "Reply posted");
                Outcome::Sent
            }
            Err(err) => {
                error!(review_id = review.id, event = kind.name(), error = %err, "Failed to post reply");
                Outcome::Failed
            }
        }
    }

    /// `None` when the event needs no reply or cannot be rendered.
    fn render_reply(&self, review: &Review, kind: &EventKind) -> Option<Message> {
        match kind {
            EventKind::Discovered => None,
            EventKind::NewRevision { .. } => Some(self.renderer.new_revision()),
            EventKind::StateChanged { .. } => Some(self.renderer.state_changed(review)),
            EventKind::TestStatusChanged { to, .. } => {
                let run = match self.source.fetch_test_runs(review.id) {
                    Ok(runs) => runs.into_iter().next(),
                    Err(err) => {
                        error!(review_id = review.id, error = %err, "Test run lookup failed");
                        None
                    }
                };
                match run {
                    Some(run) => {
                        debug!(review_id = review.id, test_run = run.id, "Linking latest test run");
                        Some(self.renderer.test_status_changed(*to, &run))
                    }
                    None => {
                        error!(review_id = review.id, "Could not locate test runs for review");
                        None
                    }
                }
            }
            EventKind::CommitLanded { commit } => Some(self.renderer.commit_landed(*commit)),
            EventKind::VoteChanged {
                user,
                value,
                version,
            } => Some(self.renderer.vote_changed(user, *value, *version)),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::cell::{Cell, RefCell};

    use super::*;
    use crate::{
        config::EventIcons,
        domain::{SwarmGroup, SwarmUser, TestRun, TrackedReview},
        slack::NotifyError,
        storage::tests::review,
        swarm::FetchError,
    };

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Sent {
        Top { channel: String, message: Message },
        Reply { thread: ThreadHandle, text: String },
    }

    /// Records every post; threads are numbered from 1.
    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub sent: RefCell<Vec<Sent>>,
        pub fail_top: Cell<bool>,
        pub fail_replies: Cell<bool>,
    }

    impl RecordingNotifier {
        pub(crate) fn tops(&self) -> usize {
            self.sent
                .borrow()
                .iter()
                .filter(|sent| matches!(sent, Sent::Top { .. }))
                .count()
        }

        pub(crate) fn replies(&self) -> Vec<String> {
            self.sent
                .borrow()
                .iter()
                .filter_map(|sent| match sent {
                    Sent::Reply { text, .. } => Some(text.clone()),
                    Sent::Top { .. } => None,
                })
                .collect()
        }
    }

    impl Notifier for RecordingNotifier {
        fn post_top(&self, channel: &str, message: &Message) -> Result<ThreadHandle, NotifyError> {
            if self.fail_top.get() {
                return Err(NotifyError::Rejected("channel_not_found".into()));
            }
            let mut sent = self.sent.borrow_mut();
            sent.push(Sent::Top {
                channel: channel.to_owned(),
                message: message.clone(),
            });
            Ok(ThreadHandle {
                channel: channel.to_owned(),
                ts: format!("{}.0", sent.len()),
            })
        }

        fn post_reply(&self, thread: &ThreadHandle, message: &Message) -> Result<(), NotifyError> {
            if self.fail_replies.get() {
                return Err(NotifyError::Rejected("thread_not_found".into()));
            }
            self.sent.borrow_mut().push(Sent::Reply {
                thread: thread.clone(),
                text: message.text.clone(),
            });
            Ok(())
        }
    }

    pub(crate) struct Echo;

    impl MentionResolver for Echo {
        fn resolve_mention(&self, username: &str) -> String {
            format!("U_{}", username.to_uppercase())
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeSwarm {
        pub reviews: RefCell<Option<Vec<Review>>>,
        pub test_runs: Vec<TestRun>,
        pub groups: Vec<SwarmGroup>,
    }

    impl ReviewSource for FakeSwarm {
        fn fetch_reviews(&self) -> Result<Vec<Review>, FetchError> {
            self.reviews
                .borrow()
                .clone()
                .ok_or(FetchError::MissingData("reviews"))
        }

        fn fetch_test_runs(&self, _review_id: ReviewId) -> Result<Vec<TestRun>, FetchError> {
            Ok(self.test_runs.clone())
        }

        fn fetch_groups(&self) -> Result<Vec<SwarmGroup>, FetchError> {
            Ok(self.groups.clone())
        }

        fn fetch_user(&self, _username: &str) -> Result<Option<SwarmUser>, FetchError> {
            Ok(None)
        }
    }

    fn renderer() -> Renderer {
        Renderer::new(EventIcons::default(), "https://swarm.example.com")
    }

    fn event(review_id: ReviewId, kind: EventKind) -> ReviewEvent {
        ReviewEvent { review_id, kind }
    }

    fn run_dispatch(
        notifier: &RecordingNotifier,
        source: &FakeSwarm,
        events: &[ReviewEvent],
        cache: &mut ReviewCache,
    ) -> DispatchReport {
        let renderer = renderer();
        let groups = GroupDirectory::default();
        Dispatcher {
            notifier,
            source,
            mentions: &Echo,
            renderer: &renderer,
            groups: &groups,
            channel: "C_REVIEWS",
        }
        .dispatch(events, cache)
    }

    fn cache_with(reviews: Vec<Review>) -> ReviewCache {
        reviews.into_iter().map(TrackedReview::untracked).collect()
    }

    #[test]
    fn discovered_creates_thread_without_reply() {
        let notifier = RecordingNotifier::default();
        let mut cache = cache_with(vec![review(1)]);

        let report = run_dispatch(
            &notifier,
            &FakeSwarm::default(),
            &[event(1, EventKind::Discovered)],
            &mut cache,
        );

        assert_eq!(report.threads_created, 1);
        assert_eq!(report.replies_sent, 0);
        assert!(matches!(
            &notifier.sent.borrow()[0],
            Sent::Top { channel, message }
                if channel == "C_REVIEWS" && message.text == "Review 1: Review 1"
        ));
        assert_eq!(cache.thread(1).map(|thread| thread.ts.as_str()), Some("1.0"));
    }

    #[test]
    fn first_reply_opens_thread_then_reuses_it() {
        let notifier = RecordingNotifier::default();
        let mut cache = cache_with(vec![review(2)]);
        let events = [
            event(2, EventKind::NewRevision { latest_change: 12 }),
            event(
                2,
                EventKind::VoteChanged {
                    user: "bob".into(),
                    value: -1,
                    version: 2,
                },
            ),
        ];

        let report = run_dispatch(&notifier, &FakeSwarm::default(), &events, &mut cache);

        assert_eq!(report.threads_created, 1);
        assert_eq!(report.replies_sent, 2);
        assert_eq!(notifier.tops(), 1);
        let sent = notifier.sent.borrow();
        let expected_thread = cache.thread(2).cloned().expect("thread stored");
        for entry in sent.iter().skip(1) {
            assert!(matches!(entry, Sent::Reply { thread, .. } if *thread == expected_thread));
        }
    }

    #[test]
    fn existing_thread_is_never_recreated() {
        let notifier = RecordingNotifier::default();
        let thread = ThreadHandle {
            channel: "C_OLD".into(),
            ts: "42.0".into(),
        };
        let mut cache: ReviewCache = [TrackedReview {
            review: review(42),
            thread: Some(thread.clone()),
        }]
        .into_iter()
        .collect();

        run_dispatch(
            &notifier,
            &FakeSwarm::default(),
            &[event(
                42,
                EventKind::StateChanged {
                    from: "needsReview".into(),
                    to: "approved".into(),
                },
            )],
            &mut cache,
        );

        assert_eq!(notifier.tops(), 0);
        assert!(matches!(&notifier.sent.borrow()[0], Sent::Reply { thread: used, .. } if *used == thread));
    }

    #[test]
    fn running_test_status_is_suppressed_without_thread() {
        let notifier = RecordingNotifier::default();
        let mut cache = cache_with(vec![review(3)]);

        let report = run_dispatch(
            &notifier,
            &FakeSwarm::default(),
            &[event(
                3,
                EventKind::TestStatusChanged {
                    from: TestStatus::Pass,
                    to: TestStatus::Running,
                },
            )],
            &mut cache,
        );

        assert_eq!(report.suppressed, 1);
        assert!(notifier.sent.borrow().is_empty());
        assert!(cache.thread(3).is_none());
    }

    #[test]
    fn finished_test_status_links_latest_run() {
        let notifier = RecordingNotifier::default();
        let source = FakeSwarm {
            test_runs: vec![TestRun {
                id: 9,
                version: 2,
                url: "https://ci/9".into(),
            }],
            ..FakeSwarm::default()
        };
        let mut cache = cache_with(vec![review(4)]);

        run_dispatch(
            &notifier,
            &source,
            &[event(
                4,
                EventKind::TestStatusChanged {
                    from: TestStatus::Running,
                    to: TestStatus::Pass,
                },
            )],
            &mut cache,
        );

        assert_eq!(
            notifier.replies(),
            vec![":green_circle: <https://ci/9|Test run v2> changed to *PASS*".to_owned()]
        );
    }

    #[test]
    fn missing_test_runs_skip_reply_but_keep_thread() {
        let notifier = RecordingNotifier::default();
        let mut cache = cache_with(vec![review(5)]);

        let report = run_dispatch(
            &notifier,
            &FakeSwarm::default(),
            &[event(
                5,
                EventKind::TestStatusChanged {
                    from: TestStatus::Running,
                    to: TestStatus::Fail,
                },
            )],
            &mut cache,
        );

        assert_eq!(report.threads_created, 1);
        assert_eq!(report.suppressed, 1);
        assert!(notifier.replies().is_empty());
    }

    #[test]
    fn failed_thread_creation_skips_remaining_events_for_review() {
        let notifier = RecordingNotifier::default();
        notifier.fail_top.set(true);
        let mut cache = cache_with(vec![review(6)]);
        let events = [
            event(6, EventKind::CommitLanded { commit: 700 }),
            event(
                6,
                EventKind::VoteChanged {
                    user: "bob".into(),
                    value: 1,
                    version: 1,
                },
            ),
        ];

        let report = run_dispatch(&notifier, &FakeSwarm::default(), &events, &mut cache);

        assert_eq!(report.failed, 2);
        assert!(notifier.sent.borrow().is_empty());
        assert!(cache.thread(6).is_none());
    }

    #[test]
    fn failed_reply_is_counted_and_dispatch_continues() {
        let notifier = RecordingNotifier::default();
        notifier.fail_replies.set(true);
        let mut cache = cache_with(vec![review(7), review(8)]);
        let events = [
            event(7, EventKind::CommitLanded { commit: 1 }),
            event(8, EventKind::Discovered),
        ];

        let report = run_dispatch(&notifier, &FakeSwarm::default(), &events, &mut cache);

        assert_eq!(report.failed, 1);
        assert_eq!(report.threads_created, 2);
        assert!(cache.thread(7).is_some());
    }

    #[test]
    fn thread_root_mentions_resolved_author_and_reviewers() {
        let notifier = RecordingNotifier::default();
        let renderer = renderer();
        let groups = GroupDirectory::default();
        let dispatcher = Dispatcher {
            notifier: &notifier,
            source: &FakeSwarm::default(),
            mentions: &Echo,
            renderer: &renderer,
            groups: &groups,
            channel: "C",
        };

        let thread = dispatcher.open_thread(&review(11)).expect("thread");
        assert_eq!(thread.ts, "1.0");
        let expected = renderer.thread_root(&review(11), "U_ALICE", &["U_BOB".to_owned()]);
        assert!(matches!(&notifier.sent.borrow()[0], Sent::Top { message, .. } if *message == expected));
    }
}
