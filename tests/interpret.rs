use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

use flint::vm::{InterpretError, VM};

#[derive(Clone, Default)]
struct CapturedOutput(Rc<RefCell<Vec<u8>>>);

impl Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn run(source: &str) -> (Result<(), InterpretError>, String) {
    let output = CapturedOutput::default();
    let mut vm = VM::with_output(Box::new(output.clone()));
    let result = vm.interpret(source);
    let text = String::from_utf8(output.0.borrow().clone()).expect("output is not utf-8");
    (result, text)
}

fn expect_output(source: &str, expected: &str) {
    let (result, output) = run(source);
    assert_eq!(result, Ok(()), "program failed:\n{}", source);
    assert_eq!(output, expected, "wrong output for:\n{}", source);
}

#[test]
fn arithmetic_with_precedence() {
    expect_output("print 1 + 2 * 3;", "7\n");
}

#[test]
fn string_concat_hits_the_intern_table() {
    expect_output(r#"var a = "foo"; var b = "f" + "oo"; print a == b;"#, "true\n");
}

#[test]
fn counter_closure_shares_its_upvalue() {
    expect_output(
        r#"fun makeCounter() {
               var x = 0;
               fun inc() { x = x + 1; print x; }
               return inc;
           }
           var c = makeCounter();
           c(); c(); c();"#,
        "1\n2\n3\n",
    );
}

#[test]
fn class_with_initializer_and_method() {
    expect_output(
        r#"class Point {
               init(x, y) { this.x = x; this.y = y; }
               sum() { return this.x + this.y; }
           }
           print Point(3, 4).sum();"#,
        "7\n",
    );
}

#[test]
fn unknown_global_fails_at_runtime() {
    let (result, output) = run("print unknown;");
    assert_eq!(result, Err(InterpretError::Runtime));
    assert_eq!(output, "");
}

#[test]
fn for_loop_counts_up() {
    expect_output("for (var i = 0; i < 3; i = i + 1) print i;", "0\n1\n2\n");
}

#[test]
fn fibonacci_via_recursion() {
    expect_output(
        r#"fun fib(n) {
               if (n < 2) return n;
               return fib(n - 1) + fib(n - 2);
           }
           print fib(12);"#,
        "144\n",
    );
}

#[test]
fn while_loop_with_compound_condition() {
    expect_output(
        r#"var i = 0;
           var hits = 0;
           while (i < 10 and hits < 3) {
               hits = hits + 1;
               i = i + 2;
           }
           print i;
           print hits;"#,
        "6\n3\n",
    );
}

#[test]
fn truthiness_follows_nil_and_false_only() {
    expect_output(
        r#"if (0) print "zero is truthy";
           if ("") print "empty string is truthy";
           if (nil) print "nope"; else print "nil is falsey";
           if (false) print "nope"; else print "false is falsey";"#,
        "zero is truthy\nempty string is truthy\nnil is falsey\nfalse is falsey\n",
    );
}

#[test]
fn comparison_operator_family() {
    expect_output(
        r#"print 1 < 2;
           print 2 <= 2;
           print 3 > 4;
           print 4 >= 4;
           print 1 == 1;
           print 1 != 1;
           print "a" == "a";
           print "a" == "b";
           print nil == nil;
           print 1 == "1";"#,
        "true\ntrue\nfalse\ntrue\ntrue\nfalse\ntrue\nfalse\ntrue\nfalse\n",
    );
}

#[test]
fn methods_close_over_this() {
    expect_output(
        r#"class Button {
               init(label) { this.label = label; }
               handler() {
                   fun callback() { print this.label; }
                   return callback;
               }
           }
           var cb = Button("ok").handler();
           cb();"#,
        "ok\n",
    );
}

#[test]
fn instances_print_with_their_class_name() {
    expect_output(
        r#"class Widget {}
           var w = Widget();
           print w;
           print Widget;
           fun helper() {}
           print helper;
           print clock == clock;"#,
        "Widget instance\nWidget\n<fn helper>\ntrue\n",
    );
}

#[test]
fn nested_closures_capture_through_levels() {
    expect_output(
        r#"fun outer() {
               var a = 1;
               fun middle() {
                   fun inner() { print a; }
                   return inner;
               }
               return middle();
           }
           outer()();"#,
        "1\n",
    );
}

#[test]
fn loop_variables_are_closed_per_iteration_scope() {
    expect_output(
        r#"var first;
           var second;
           {
               var i = 0;
               while (i < 2) {
                   var captured = i;
                   fun show() { print captured; }
                   if (i == 0) first = show;
                   else second = show;
                   i = i + 1;
               }
           }
           first();
           second();"#,
        "0\n1\n",
    );
}

#[test]
fn compile_error_reports_and_aborts() {
    let (result, output) = run("var = 1;");
    assert_eq!(result, Err(InterpretError::Compile));
    assert_eq!(output, "");
}

#[test]
fn runtime_error_inside_call_unwinds() {
    let (result, output) = run(
        r#"fun touchMissing() { print absent; }
           print "before";
           touchMissing();"#,
    );
    assert_eq!(result, Err(InterpretError::Runtime));
    assert_eq!(output, "before\n");
}

#[test]
fn stress_gc_matches_normal_execution() {
    let source = r#"
        fun compose(f, g) {
            fun inner(x) { return f(g(x)); }
            return inner;
        }
        fun inc(x) { return x + 1; }
        fun double(x) { return x + x; }
        var f = compose(inc, double);
        print f(20);

        var words = "";
        for (var i = 0; i < 8; i = i + 1) {
            words = words + "ab";
        }
        print words;

        class Node {
            init(value) { this.value = value; this.next = nil; }
        }
        var head = Node(1);
        head.next = Node(2);
        head.next.next = Node(3);
        var total = 0;
        var cursor = head;
        while (cursor != nil) {
            total = total + cursor.value;
            cursor = cursor.next;
        }
        print total;
    "#;

    let (plain_result, plain) = run(source);
    assert_eq!(plain_result, Ok(()));

    let output = CapturedOutput::default();
    let mut vm = VM::with_output(Box::new(output.clone()));
    vm.set_gc_stress(true);
    assert_eq!(vm.interpret(source), Ok(()));
    let stressed = String::from_utf8(output.0.borrow().clone()).expect("output is not utf-8");

    assert_eq!(plain, stressed);
}
