use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::download::ProgressEvent;
use crate::history::HistoryTracker;

/// Receives progress events on the observer side.
pub trait ProgressObserver {
    fn deliver(&mut self, event: &ProgressEvent);
}

impl<F> ProgressObserver for F
where
    F: FnMut(&ProgressEvent),
{
    fn deliver(&mut self, event: &ProgressEvent) {
        self(event)
    }
}

/// Observer end of one job's event channel. Completed items are appended to
/// the history before the observer sees them.
#[derive(Debug)]
pub struct ProgressReporter {
    events_rx: mpsc::Receiver<ProgressEvent>,
    finished: bool,
}

impl ProgressReporter {
    pub(crate) fn new(events_rx: mpsc::Receiver<ProgressEvent>) -> Self {
        Self {
            events_rx,
            finished: false,
        }
    }

    /// Delivers every pending event in order and returns how many there were.
    pub fn drain_into<O>(&mut self, history: &mut HistoryTracker, observer: &mut O) -> usize
    where
        O: ProgressObserver + ?Sized,
    {
        let mut delivered = 0;
        while !self.finished {
            match self.events_rx.try_recv() {
                Ok(event) => {
                    self.record(history, &event);
                    observer.deliver(&event);
                    delivered += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.finished = true,
            }
        }
        delivered
    }

    pub fn drain(&mut self, history: &mut HistoryTracker) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        self.drain_into(history, &mut |event: &ProgressEvent| events.push(event.clone()));
        events
    }

    pub async fn next(&mut self, history: &mut HistoryTracker) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }
        match self.events_rx.recv().await {
            Some(event) => {
                self.record(history, &event);
                Some(event)
            }
            None => {
                self.finished = true;
                None
            }
        }
    }

    /// True once the terminal event has been received or the job's sender
    /// is gone.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn record(&mut self, history: &mut HistoryTracker, event: &ProgressEvent) {
        if let ProgressEvent::ItemDone { name, .. } = event {
            history.append(name.clone());
        }
        if event.is_terminal() {
            self.finished = true;
        }
    }
}
