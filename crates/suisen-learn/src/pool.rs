//! ジョブキューとワーカプール
//!
//! 固定数の常駐ワーカがキューからジョブを取り出して処理する。
//! 「キューが空 かつ 実行中ワーカ数が0」をもってアイドルとみなし、
//! これが両レジームのステージ間の唯一の同期フェンスになる。
//! アクティブカウンタはキューのロックを持ったままインクリメントする
//! ため、`wait_idle` がジョブの取り出しと完了の間を取りこぼすことはない。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// ワーカが空のキューを見たときに眠る時間
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// 共有ジョブキュー
pub struct JobQueue<J> {
    jobs: Mutex<VecDeque<J>>,
    active: AtomicI32,
    shutdown: AtomicBool,
    /// 置換表クリア要求の世代カウンタ。ワーカは次のジョブ取得前に確認する。
    clear_generation: AtomicU64,
}

impl<J> JobQueue<J> {
    pub fn new() -> JobQueue<J> {
        JobQueue {
            jobs: Mutex::new(VecDeque::new()),
            active: AtomicI32::new(0),
            shutdown: AtomicBool::new(false),
            clear_generation: AtomicU64::new(0),
        }
    }

    /// ジョブを積む
    pub fn push(&self, job: J) {
        self.jobs.lock().expect("queue lock").push_back(job);
    }

    /// 複数のジョブを積む
    pub fn push_all<I: IntoIterator<Item = J>>(&self, jobs: I) {
        let mut q = self.jobs.lock().expect("queue lock");
        q.extend(jobs);
    }

    /// 積まれているジョブ数
    pub fn len(&self) -> usize {
        self.jobs.lock().expect("queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// ジョブを1つ取り出す。取り出しと同時にアクティブカウンタを上げる。
    fn try_pop(&self) -> Option<J> {
        let mut q = self.jobs.lock().expect("queue lock");
        let job = q.pop_front()?;
        self.active.fetch_add(1, Ordering::SeqCst);
        Some(job)
    }

    /// ジョブ完了の申告
    fn complete(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// アイドル（キューが空 かつ 実行中ジョブなし）かどうか
    pub fn is_idle(&self) -> bool {
        let q = self.jobs.lock().expect("queue lock");
        q.is_empty() && self.active.load(Ordering::SeqCst) == 0
    }

    /// アイドルになるまで待つ
    pub fn wait_idle(&self) {
        while !self.is_idle() {
            thread::sleep(IDLE_SLEEP);
        }
    }

    /// ワーカの協調終了を要求する
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// 全ワーカに探索キャッシュのクリアを要求する（次のジョブ取得前に反映）
    pub fn request_clear(&self) {
        self.clear_generation.fetch_add(1, Ordering::SeqCst);
    }

    fn clear_generation(&self) -> u64 {
        self.clear_generation.load(Ordering::SeqCst)
    }
}

impl<J> Default for JobQueue<J> {
    fn default() -> Self {
        JobQueue::new()
    }
}

/// 常駐ワーカのプール
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// ワーカを起動する
    ///
    /// `workers` の要素がそのままワーカごとの状態（探索器・乱数など）になる。
    /// `on_clear` は `JobQueue::request_clear` への応答としてジョブ取得前に呼ばれる。
    pub fn start<J, W, F, C>(
        queue: &Arc<JobQueue<J>>,
        workers: Vec<W>,
        handler: F,
        on_clear: C,
    ) -> WorkerPool
    where
        J: Send + 'static,
        W: Send + 'static,
        F: Fn(usize, &mut W, J) + Send + Sync + 'static,
        C: Fn(&mut W) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let on_clear = Arc::new(on_clear);
        let handles = workers
            .into_iter()
            .enumerate()
            .map(|(wn, mut w)| {
                let queue = Arc::clone(queue);
                let handler = Arc::clone(&handler);
                let on_clear = Arc::clone(&on_clear);
                thread::spawn(move || {
                    let mut seen = queue.clear_generation();
                    while !queue.is_shutdown() {
                        let gen = queue.clear_generation();
                        if gen != seen {
                            seen = gen;
                            on_clear(&mut w);
                        }
                        match queue.try_pop() {
                            Some(job) => {
                                handler(wn, &mut w, job);
                                queue.complete();
                            }
                            None => thread::sleep(IDLE_SLEEP),
                        }
                    }
                })
            })
            .collect();
        WorkerPool { handles }
    }

    /// 全ワーカの終了を待つ。事前に `request_shutdown` を呼ぶこと。
    pub fn join(self) {
        for h in self.handles {
            let _ = h.join();
        }
    }
}
