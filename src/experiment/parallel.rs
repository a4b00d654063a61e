//! Bounded worker pool for embarrassingly parallel macroreplications.
//!
//! Work items are identified by index only. Each worker pulls indices from a
//! shared queue and sends `(index, output)` back; outputs are reassembled in
//! index order, so the result never depends on scheduling.

use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};

/// Applies `task` to every index in `0..count` on up to `workers` threads.
pub(crate) fn map_indexed<T, F>(count: usize, workers: usize, task: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync,
{
    let workers = workers.max(1).min(count);
    if workers <= 1 {
        return (0..count).map(task).collect();
    }

    let (job_tx, job_rx) = bounded::<usize>(count);
    let (out_tx, out_rx) = bounded::<(usize, T)>(count);
    for index in 0..count {
        // Capacity equals `count`; this never blocks.
        let _ = job_tx.send(index);
    }
    drop(job_tx);

    let task = &task;
    thread::scope(|scope| {
        for idx in 0..workers {
            let rx: Receiver<usize> = job_rx.clone();
            let tx: Sender<(usize, T)> = out_tx.clone();
            thread::Builder::new()
                .name(format!("simopt-worker-{idx}"))
                .spawn_scoped(scope, move || {
                    while let Ok(index) = rx.recv() {
                        let _ = tx.send((index, task(index)));
                    }
                })
                .expect("failed to spawn simopt worker");
        }
    });
    drop(out_tx);

    let mut slots: Vec<Option<T>> = (0..count).map(|_| None).collect();
    for (index, output) in out_rx.try_iter() {
        slots[index] = Some(output);
    }
    slots.into_iter().flatten().collect()
}

/// Runs `task`, converting a panic into an error message.
pub(crate) fn catch_panic<T, F>(task: F) -> Result<T, String>
where
    F: FnOnce() -> T,
{
    panic::catch_unwind(AssertUnwindSafe(task)).map_err(|payload| {
        if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "adapter panicked".to_string()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_are_in_index_order() {
        for workers in [1, 2, 4, 16] {
            let out = map_indexed(25, workers, |i| i * i);
            assert_eq!(out, (0..25).map(|i| i * i).collect::<Vec<_>>());
        }
    }

    #[test]
    fn empty_input() {
        let out: Vec<usize> = map_indexed(0, 4, |i| i);
        assert!(out.is_empty());
    }

    #[test]
    fn panics_become_errors() {
        let ok = catch_panic(|| 7);
        assert_eq!(ok, Ok(7));
        let err = catch_panic(|| -> usize { panic!("solver exploded") });
        assert_eq!(err, Err("solver exploded".to_string()));
    }
}
