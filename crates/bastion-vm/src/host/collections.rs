//! `List<T>`, lazy sequences and the `System.Linq.Enumerable` subset.

use std::sync::{Arc, Mutex};

use bastion::ResourceGuard;
use bastion_il::TypeSig;

use super::ParamKind::{Any, Int, Seq};
use super::{arg, host, host_arg, int_arg, invalid_cast, out_of_range, throw, HostMember, HostObject};
use crate::error::{fault, Flow};
use crate::value::{lock, ArrayData, Value};

type Ret = Result<Option<Value>, Flow>;

pub(super) static MEMBERS: &[HostMember] = &[
    HostMember { owner: "System.Collections.Generic.List`1", name: ".ctor", is_static: false, params: &[], func: list_new },
    HostMember { owner: "System.Collections.Generic.List`1", name: ".ctor", is_static: false, params: &[Int], func: list_with_capacity },
    HostMember { owner: "System.Collections.Generic.List`1", name: ".ctor", is_static: false, params: &[Seq], func: list_from },
    HostMember { owner: "System.Collections.Generic.List`1", name: "Add", is_static: false, params: &[Any], func: list_add },
    HostMember { owner: "System.Collections.Generic.List`1", name: "AddRange", is_static: false, params: &[Seq], func: list_add_range },
    HostMember { owner: "System.Collections.Generic.List`1", name: "get_Count", is_static: false, params: &[], func: list_count },
    HostMember { owner: "System.Collections.Generic.List`1", name: "get_Item", is_static: false, params: &[Int], func: list_get },
    HostMember { owner: "System.Collections.Generic.List`1", name: "set_Item", is_static: false, params: &[Int, Any], func: list_set },
    HostMember { owner: "System.Collections.Generic.List`1", name: "Contains", is_static: false, params: &[Any], func: list_contains },
    HostMember { owner: "System.Collections.Generic.List`1", name: "Clear", is_static: false, params: &[], func: list_clear },
    HostMember { owner: "System.Collections.Generic.List`1", name: "ToArray", is_static: false, params: &[], func: list_to_array },
    HostMember { owner: "System.Linq.Enumerable", name: "Range", is_static: true, params: &[Int, Int], func: enumerable_range },
    HostMember { owner: "System.Linq.Enumerable", name: "Repeat", is_static: true, params: &[Any, Int], func: enumerable_repeat },
    HostMember { owner: "System.Linq.Enumerable", name: "ToList", is_static: true, params: &[Seq], func: enumerable_to_list },
    HostMember { owner: "System.Linq.Enumerable", name: "ToArray", is_static: true, params: &[Seq], func: enumerable_to_array },
    HostMember { owner: "System.Linq.Enumerable", name: "Count", is_static: true, params: &[Seq], func: enumerable_count },
    HostMember { owner: "System.Linq.Enumerable", name: "Sum", is_static: true, params: &[Seq], func: enumerable_sum },
];

/// Lazily produced sequence. Items are computed when pulled, never stored up front.
#[derive(Debug)]
pub enum Sequence {
    Range { start: i32, count: i32 },
    Repeat { value: Value, count: i32 },
    /// Charges one allocation unit on `guard` for every item pulled from `inner`.
    Charged { inner: Value, guard: Arc<ResourceGuard> },
}

type Items<'a> = Box<dyn Iterator<Item = Result<Value, Flow>> + 'a>;

impl Sequence {
    fn items(&self) -> Result<Items<'_>, Flow> {
        match self {
            Sequence::Range { start, count } => {
                let start = *start;
                Ok(Box::new((0..*count).map(move |i| Ok(Value::I32(start.wrapping_add(i))))))
            }
            Sequence::Repeat { value, count } => Ok(Box::new(
                std::iter::repeat(value.clone())
                    .take(usize::try_from(*count).unwrap_or(0))
                    .map(Ok),
            )),
            Sequence::Charged { inner, guard } => {
                let inner = items(inner)?;
                Ok(Box::new(
                    guard
                        .charged(inner)
                        .map(|item| item.map_err(Flow::from).and_then(|item| item)),
                ))
            }
        }
    }
}

/// Iterates anything the program may pass as a sequence. Lists and arrays are snapshotted.
pub(crate) fn items(value: &Value) -> Result<Items<'_>, Flow> {
    match value {
        Value::Null => Err(throw("System.ArgumentNullException", "Value cannot be null. (Parameter 'source')")),
        Value::Array(array) => Ok(Box::new(lock(&array.items).clone().into_iter().map(Ok))),
        Value::Str(text) => Ok(Box::new(text.chars().map(|c| Ok(Value::I32(c as i32))))),
        Value::Host(object) => match object.as_ref() {
            HostObject::List(list) => Ok(Box::new(lock(list).clone().into_iter().map(Ok))),
            HostObject::Sequence(seq) => seq.items(),
            _ => Err(invalid_cast(value, "System.Collections.IEnumerable")),
        },
        other => Err(invalid_cast(other, "System.Collections.IEnumerable")),
    }
}

/// Pulls every item of a sequence, stopping at the first failure.
pub(crate) fn collect(value: &Value) -> Result<Vec<Value>, Flow> {
    items(value)?.collect()
}

fn list(args: &[Value]) -> Result<&Mutex<Vec<Value>>, Flow> {
    match host_arg(args, 0)? {
        HostObject::List(items) => Ok(items),
        other => Err(fault(format!("List member on {}", other.type_name()))),
    }
}

fn index(args: &[Value], at: usize, len: usize) -> Result<usize, Flow> {
    usize::try_from(int_arg(args, at)?)
        .ok()
        .filter(|i| *i < len)
        .ok_or_else(|| out_of_range("index"))
}

fn new_list(items: Vec<Value>) -> Ret {
    Ok(host(HostObject::List(Mutex::new(items))))
}

fn list_new(_args: Vec<Value>) -> Ret {
    new_list(Vec::new())
}

fn list_with_capacity(args: Vec<Value>) -> Ret {
    let capacity = usize::try_from(int_arg(&args, 0)?).map_err(|_| out_of_range("capacity"))?;
    new_list(Vec::with_capacity(capacity.min(1 << 16)))
}

fn list_from(args: Vec<Value>) -> Ret {
    new_list(collect(arg(&args, 0)?)?)
}

fn list_add(args: Vec<Value>) -> Ret {
    lock(list(&args)?).push(arg(&args, 1)?.clone());
    Ok(None)
}

fn list_add_range(args: Vec<Value>) -> Ret {
    let extra = collect(arg(&args, 1)?)?;
    lock(list(&args)?).extend(extra);
    Ok(None)
}

fn list_count(args: Vec<Value>) -> Ret {
    let len = lock(list(&args)?).len();
    Ok(Some(Value::I32(i32::try_from(len).unwrap_or(i32::MAX))))
}

fn list_get(args: Vec<Value>) -> Ret {
    let items = lock(list(&args)?);
    let at = index(&args, 1, items.len())?;
    Ok(Some(items[at].clone()))
}

fn list_set(args: Vec<Value>) -> Ret {
    let mut items = lock(list(&args)?);
    let at = index(&args, 1, items.len())?;
    items[at] = arg(&args, 2)?.clone();
    Ok(None)
}

fn list_contains(args: Vec<Value>) -> Ret {
    let needle = arg(&args, 1)?;
    let found = lock(list(&args)?).iter().any(|item| item.same(needle));
    Ok(Some(Value::Bool(found)))
}

fn list_clear(args: Vec<Value>) -> Ret {
    lock(list(&args)?).clear();
    Ok(None)
}

fn to_array(items: Vec<Value>) -> Option<Value> {
    Some(Value::Array(Arc::new(ArrayData {
        elem: TypeSig::Object,
        items: Mutex::new(items),
    })))
}

fn list_to_array(args: Vec<Value>) -> Ret {
    let items = lock(list(&args)?).clone();
    Ok(to_array(items))
}

fn count_arg(args: &[Value], at: usize) -> Result<i32, Flow> {
    let count = int_arg(args, at)?;
    i32::try_from(count)
        .ok()
        .filter(|c| *c >= 0)
        .ok_or_else(|| out_of_range("count"))
}

fn enumerable_range(args: Vec<Value>) -> Ret {
    let start = i32::try_from(int_arg(&args, 0)?).map_err(|_| out_of_range("start"))?;
    let count = count_arg(&args, 1)?;
    if i64::from(start) + i64::from(count) - 1 > i64::from(i32::MAX) {
        return Err(out_of_range("count"));
    }
    Ok(host(HostObject::Sequence(Sequence::Range { start, count })))
}

fn enumerable_repeat(args: Vec<Value>) -> Ret {
    let value = arg(&args, 0)?.clone();
    let count = count_arg(&args, 1)?;
    Ok(host(HostObject::Sequence(Sequence::Repeat { value, count })))
}

fn enumerable_to_list(args: Vec<Value>) -> Ret {
    new_list(collect(arg(&args, 0)?)?)
}

fn enumerable_to_array(args: Vec<Value>) -> Ret {
    Ok(to_array(collect(arg(&args, 0)?)?))
}

fn enumerable_count(args: Vec<Value>) -> Ret {
    let mut count: i32 = 0;
    for item in items(arg(&args, 0)?)? {
        item?;
        count = count
            .checked_add(1)
            .ok_or_else(|| throw("System.OverflowException", "Arithmetic operation resulted in an overflow."))?;
    }
    Ok(Some(Value::I32(count)))
}

fn enumerable_sum(args: Vec<Value>) -> Ret {
    let mut sum: i32 = 0;
    for item in items(arg(&args, 0)?)? {
        let item = item?;
        let value = item.as_i32().ok_or_else(|| invalid_cast(&item, "System.Int32"))?;
        sum = sum
            .checked_add(value)
            .ok_or_else(|| throw("System.OverflowException", "Arithmetic operation resulted in an overflow."))?;
    }
    Ok(Some(Value::I32(sum)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_value(items: Vec<Value>) -> Value {
        Value::Host(Arc::new(HostObject::List(Mutex::new(items))))
    }

    #[test]
    fn range_is_lazy_and_counts() {
        let range = enumerable_range(vec![Value::I32(5), Value::I32(3)]).expect("ok").expect("seq");
        let items = collect(&range).expect("items");
        assert_eq!(items.len(), 3);
        assert!(items[2].same(&Value::I32(7)));
        let sum = enumerable_sum(vec![range]).expect("ok").expect("sum");
        assert!(sum.same(&Value::I32(18)));
    }

    #[test]
    fn negative_counts_throw() {
        assert!(matches!(
            enumerable_range(vec![Value::I32(0), Value::I32(-1)]),
            Err(Flow::Exception(_))
        ));
        assert!(matches!(
            list_with_capacity(vec![Value::I32(-4)]),
            Err(Flow::Exception(_))
        ));
    }

    #[test]
    fn list_indexing_is_bounds_checked() {
        let list = list_value(vec![Value::I32(1)]);
        assert!(list_get(vec![list.clone(), Value::I32(0)]).is_ok());
        assert!(matches!(list_get(vec![list.clone(), Value::I32(1)]), Err(Flow::Exception(_))));
        list_add_range(vec![list.clone(), list_value(vec![Value::I32(2), Value::I32(3)])]).expect("add range");
        let count = list_count(vec![list]).expect("ok").expect("count");
        assert!(count.same(&Value::I32(3)));
    }

    #[test]
    fn null_source_throws() {
        assert!(matches!(collect(&Value::Null), Err(Flow::Exception(_))));
    }
}
