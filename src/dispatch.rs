//! 按名字调用已注册的操作。
//!
//! 每个名字绑定一个签名固定的闭包，调用时按名字查找。签名在注册的时候就确定了，
//! 参数和返回值的类型都由编译器检查。

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

/// 调用时可能出现的错误。
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("没有名为 {0} 的操作")]
    Unknown(String),
}

type Operation<A, R> = Arc<dyn Fn(A) -> R + Send + Sync>;

/// 名字到操作的映射。
pub struct Dispatcher<A, R> {
    operations: RwLock<HashMap<String, Operation<A, R>>>,
}

impl<A, R> Dispatcher<A, R> {
    pub fn new() -> Dispatcher<A, R> {
        Dispatcher {
            operations: RwLock::new(HashMap::new()),
        }
    }

    /// 绑定一个操作。
    ///
    /// 名字为空时返回`false`。名字已经被绑定时保留原来的操作，返回`true`。
    pub fn bind<F>(&self, name: impl Into<String>, operation: F) -> bool
    where
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        let name = name.into();
        if name.is_empty() {
            return false;
        }
        let mut operations = self.operations.write().unwrap();
        operations
            .entry(name)
            .or_insert_with(|| Arc::new(operation) as Operation<A, R>);
        true
    }

    /// 解除绑定，名字不存在时返回`false`。
    pub fn unbind(&self, name: &str) -> bool {
        self.operations.write().unwrap().remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operations.read().unwrap().contains_key(name)
    }

    /// 返回所有已绑定的名字，按字典序排列。
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operations.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn clear(&self) {
        self.operations.write().unwrap().clear();
    }

    /// 按名字调用操作。
    ///
    /// 调用期间不持有锁，操作内部可以再访问这个`Dispatcher`。
    ///
    /// # Errors
    /// 名字没有绑定时返回`DispatchError::Unknown`。
    pub fn call(&self, name: &str, args: A) -> Result<R, DispatchError> {
        let operation = self
            .operations
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| DispatchError::Unknown(name.to_string()))?;
        Ok(operation(args))
    }

    /// 用同样的参数调用所有操作，返回调用的个数。
    pub fn cast(&self, args: A) -> usize
    where
        A: Clone,
    {
        let operations: Vec<Operation<A, R>> =
            self.operations.read().unwrap().values().cloned().collect();
        for operation in &operations {
            operation(args.clone());
        }
        operations.len()
    }
}

impl<A, R> Default for Dispatcher<A, R> {
    fn default() -> Self {
        Dispatcher::new()
    }
}

impl<A, R> fmt::Debug for Dispatcher<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn call_by_name() {
        let dispatcher: Dispatcher<(i64, i64), i64> = Dispatcher::new();
        assert!(dispatcher.bind("add", |(a, b)| a + b));
        assert!(dispatcher.bind("mul", |(a, b)| a * b));

        assert_eq!(dispatcher.call("add", (2, 3)), Ok(5));
        assert_eq!(dispatcher.call("mul", (2, 3)), Ok(6));
        assert_eq!(
            dispatcher.call("sub", (2, 3)),
            Err(DispatchError::Unknown("sub".into()))
        );
        assert_eq!(dispatcher.names(), vec!["add", "mul"]);
    }

    #[test]
    fn first_binding_wins() {
        let dispatcher: Dispatcher<(), &'static str> = Dispatcher::new();
        assert!(dispatcher.bind("who", |_| "first"));
        assert!(dispatcher.bind("who", |_| "second"));
        assert!(!dispatcher.bind("", |_| "nobody"));
        assert_eq!(dispatcher.call("who", ()), Ok("first"));

        assert!(dispatcher.unbind("who"));
        assert!(!dispatcher.unbind("who"));
        assert!(!dispatcher.contains("who"));
    }

    #[test]
    fn cast_reaches_every_operation() {
        let hits = Arc::new(AtomicUsize::new(0));
        let dispatcher: Dispatcher<usize, ()> = Dispatcher::new();
        for name in ["a", "b", "c"] {
            let hits = hits.clone();
            dispatcher.bind(name, move |n| {
                hits.fetch_add(n, Ordering::SeqCst);
            });
        }

        assert_eq!(dispatcher.cast(2), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 6);
    }
}
